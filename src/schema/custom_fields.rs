// ==========================================
// CRM 导入引擎 - 团队自定义字段
// ==========================================
// 存储: crm_custom_field 表（按 team_id + entity_type）
// 说明: record 类型字段转换为 CustomFieldValue 存储的 EntityLink
// ==========================================

use crate::domain::entity_link::{EntityLink, ImportField};
use crate::domain::types::{FieldType, LinkSource, StorageType};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::schema::definitions::matchers_for_target;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// 自定义字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: String,
    pub team_id: String,
    pub entity_type: String,
    pub code: String,
    pub label: String,
    pub field_type: FieldType,
    pub options: Vec<String>,
    pub required: bool,
    pub unique: bool,
    /// record 类型字段的目标实体
    pub target_entity: Option<String>,
}

impl CustomFieldDefinition {
    pub fn new(team_id: &str, entity_type: &str, code: &str, label: &str, field_type: FieldType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            entity_type: entity_type.to_string(),
            code: code.to_string(),
            label: label.to_string(),
            field_type,
            options: Vec::new(),
            required: false,
            unique: false,
            target_entity: None,
        }
    }

    /// 转为可导入字段（record 类型返回 None）
    pub fn to_import_field(&self) -> Option<ImportField> {
        if self.field_type == FieldType::Record {
            return None;
        }
        let mut field = ImportField::new(&self.code, &self.label, self.field_type).custom();
        field.options = self.options.clone();
        field.required = self.required;
        field.unique = self.unique;
        Some(field)
    }

    /// 转为关联声明（仅 record 类型）
    pub fn to_entity_link(&self) -> Option<EntityLink> {
        if self.field_type != FieldType::Record {
            return None;
        }
        let target = self.target_entity.as_deref()?;
        let mut link = EntityLink::new(
            &self.code,
            &self.label,
            LinkSource::CustomField,
            target,
            StorageType::CustomFieldValue,
        );
        for matcher in matchers_for_target(target) {
            link = link.matcher(matcher);
        }
        Some(link)
    }
}

// ==========================================
// CustomFieldRepository
// ==========================================
pub struct CustomFieldRepository {
    conn: Arc<Mutex<Connection>>,
}

impl CustomFieldRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 新增自定义字段
    pub fn insert(&self, def: &CustomFieldDefinition) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO crm_custom_field (
                id, team_id, entity_type, code, label, field_type,
                options_json, is_required, is_unique, target_entity
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                def.id,
                def.team_id,
                def.entity_type,
                def.code,
                def.label,
                def.field_type.as_str(),
                serde_json::to_string(&def.options)
                    .map_err(|e| RepositoryError::InternalError(e.to_string()))?,
                def.required,
                def.unique,
                def.target_entity,
            ],
        )?;
        Ok(())
    }

    /// 读取团队某实体的自定义字段（按 code 排序）
    pub fn list(&self, team_id: &str, entity_type: &str) -> RepositoryResult<Vec<CustomFieldDefinition>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, team_id, entity_type, code, label, field_type,
                   options_json, is_required, is_unique, target_entity
            FROM crm_custom_field
            WHERE team_id = ?1 AND entity_type = ?2
            ORDER BY code
            "#,
        )?;

        let rows = stmt.query_map(params![team_id, entity_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, bool>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut defs = Vec::new();
        for row in rows {
            let (id, team_id, entity_type, code, label, field_type, options_json, required, unique, target) =
                row?;
            let Some(field_type) = FieldType::parse(&field_type) else {
                tracing::warn!(code = %code, field_type = %field_type, "未知自定义字段类型，已忽略");
                continue;
            };
            let options: Vec<String> = serde_json::from_str(&options_json).unwrap_or_default();
            defs.push(CustomFieldDefinition {
                id,
                team_id,
                entity_type,
                code,
                label,
                field_type,
                options,
                required,
                unique,
                target_entity: target,
            });
        }
        Ok(defs)
    }
}
