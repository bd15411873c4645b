// ==========================================
// CRM 导入引擎 - 实体模式注册表
// ==========================================
// 职责: 合并内建定义与团队自定义字段，构建只读 EntitySchema
// 缓存: (team_id, entity_type) → Arc<EntitySchema>，自定义字段变更后需 invalidate
// ==========================================

use crate::domain::entity_link::{EntityLink, ImportField, MatchKey, MatchableField, RelationshipMatcher};
use crate::domain::mapping::{ColumnData, ColumnMappings};
use crate::domain::types::{FieldType, MatchBehavior};
use crate::i18n::t_with_args;
use crate::repository::error::RepositoryError;
use crate::schema::custom_fields::{CustomFieldDefinition, CustomFieldRepository};
use crate::schema::definitions::{builtin_definition, EntityDefinition};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("不支持的实体类型: {0}")]
    UnknownEntity(String),

    #[error("模式缓存锁获取失败")]
    LockPoisoned,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// 映射校验问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingIssue {
    pub source: Option<String>,
    pub message: String,
}

// ==========================================
// EntitySchema
// ==========================================
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub team_id: String,
    pub entity_type: String,
    pub label: String,
    pub name_field: String,
    pub fields: Vec<ImportField>,
    pub links: Vec<EntityLink>,
}

impl EntitySchema {
    /// 由内建定义 + 自定义字段构建
    pub fn build(team_id: &str, def: EntityDefinition, custom: &[CustomFieldDefinition]) -> Self {
        let mut fields = def.fields;
        let mut links = def.links;

        for cf in custom {
            if fields.iter().any(|f| f.key == cf.code) || links.iter().any(|l| l.key == cf.code) {
                tracing::warn!(code = %cf.code, entity_type = def.entity_type, "自定义字段与内建字段重名，已忽略");
                continue;
            }
            if let Some(field) = cf.to_import_field() {
                fields.push(field);
            } else if let Some(link) = cf.to_entity_link() {
                links.push(link);
            }
        }

        Self {
            team_id: team_id.to_string(),
            entity_type: def.entity_type.to_string(),
            label: def.label.to_string(),
            name_field: def.name_field.to_string(),
            fields,
            links,
        }
    }

    pub fn field(&self, key: &str) -> Option<&ImportField> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn link(&self, key: &str) -> Option<&EntityLink> {
        self.links.iter().find(|l| l.key == key)
    }

    /// 字段是否写入记录（id 仅用于匹配）
    pub fn is_writable(&self, key: &str) -> bool {
        key != "id"
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &ImportField> {
        self.fields.iter().filter(|f| f.required)
    }

    /// 关联列 → (关联, 匹配器)
    pub fn relationship_matcher(&self, column: &ColumnData) -> Option<RelationshipMatcher> {
        let link = self.link(column.relationship.as_deref()?)?;
        let matcher = link.find_matcher(&column.target)?;
        Some(RelationshipMatcher {
            source: column.source.clone(),
            link: link.clone(),
            matcher: matcher.clone(),
        })
    }

    /// 某关联的所有已映射列（按匹配器优先级降序，同优先级保持映射顺序）
    pub fn relationship_matchers(&self, mappings: &ColumnMappings, link: &str) -> Vec<RelationshipMatcher> {
        let mut matchers: Vec<RelationshipMatcher> = mappings
            .columns_for_link(link)
            .into_iter()
            .filter_map(|column| self.relationship_matcher(column))
            .collect();
        matchers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        matchers
    }

    /// 主匹配字段: id + 所有 unique 字段，按优先级降序
    pub fn match_fields(&self) -> Vec<MatchableField> {
        let mut out = vec![MatchableField::id()];
        for field in self.fields.iter().filter(|f| f.unique) {
            let (priority, key) = match field.field_type {
                FieldType::Email => (90, MatchKey::CaseInsensitive),
                FieldType::Domain => (80, MatchKey::Domain),
                FieldType::Phone => (70, MatchKey::Phone),
                _ => (60, MatchKey::Exact),
            };
            out.push(
                MatchableField::new(&field.key, &field.label, priority, MatchBehavior::MatchOrCreate)
                    .compare(&field.key, key),
            );
        }
        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }

    /// 已映射的最高优先级主匹配字段
    pub fn primary_match<'a>(&self, mappings: &'a ColumnMappings) -> Option<(MatchableField, &'a ColumnData)> {
        self.match_fields()
            .into_iter()
            .find_map(|m| mappings.column_for_field(&m.field).map(|column| (m, column)))
    }

    /// 映射校验
    ///
    /// # 返回
    /// - 空: 可进入审核
    /// - 否则: 每个问题一条本地化消息
    pub fn validate_mappings(&self, mappings: &ColumnMappings) -> Vec<MappingIssue> {
        let mut issues = Vec::new();
        let mut seen_fields: Vec<&str> = Vec::new();

        for column in mappings.as_slice() {
            let source = column.source.as_str();
            match column.relationship.as_deref() {
                None => {
                    if self.field(&column.target).is_none() {
                        issues.push(MappingIssue {
                            source: Some(column.source.clone()),
                            message: t_with_args(
                                "mapping.unknown_field",
                                &[("source", source), ("field", column.target.as_str())],
                            ),
                        });
                    } else if seen_fields.contains(&column.target.as_str()) {
                        issues.push(MappingIssue {
                            source: Some(column.source.clone()),
                            message: t_with_args(
                                "mapping.duplicate_target",
                                &[("source", source), ("field", column.target.as_str())],
                            ),
                        });
                    } else {
                        seen_fields.push(column.target.as_str());
                    }
                }
                Some(link_key) => match self.link(link_key) {
                    None => issues.push(MappingIssue {
                        source: Some(column.source.clone()),
                        message: t_with_args(
                            "mapping.unknown_relationship",
                            &[("source", source), ("relationship", link_key)],
                        ),
                    }),
                    Some(link) if link.find_matcher(&column.target).is_none() => {
                        issues.push(MappingIssue {
                            source: Some(column.source.clone()),
                            message: t_with_args(
                                "mapping.unknown_matcher",
                                &[
                                    ("source", source),
                                    ("relationship", link_key),
                                    ("matcher", column.target.as_str()),
                                ],
                            ),
                        })
                    }
                    Some(_) => {}
                },
            }
        }

        // 映射了 id 时允许只做更新，不强制要求必填字段
        let update_only = mappings.column_for_field("id").is_some();
        if !update_only {
            for field in self.required_fields() {
                if mappings.column_for_field(&field.key).is_none() {
                    issues.push(MappingIssue {
                        source: None,
                        message: t_with_args(
                            "mapping.required_missing",
                            &[("field", field.label.as_str())],
                        ),
                    });
                }
            }
        }

        issues
    }
}

// ==========================================
// SchemaRegistry
// ==========================================
pub struct SchemaRegistry {
    custom_fields: CustomFieldRepository,
    cache: RwLock<HashMap<(String, String), Arc<EntitySchema>>>,
}

impl SchemaRegistry {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            custom_fields: CustomFieldRepository::new(conn),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn custom_fields(&self) -> &CustomFieldRepository {
        &self.custom_fields
    }

    /// 获取团队实体模式（首次访问时构建）
    pub fn entity_schema(&self, team_id: &str, entity_type: &str) -> SchemaResult<Arc<EntitySchema>> {
        let key = (team_id.to_string(), entity_type.to_string());
        {
            let cache = self.cache.read().map_err(|_| SchemaError::LockPoisoned)?;
            if let Some(schema) = cache.get(&key) {
                return Ok(Arc::clone(schema));
            }
        }

        let def = builtin_definition(entity_type)
            .ok_or_else(|| SchemaError::UnknownEntity(entity_type.to_string()))?;
        let custom = self.custom_fields.list(team_id, entity_type)?;
        let schema = Arc::new(EntitySchema::build(team_id, def, &custom));
        tracing::debug!(
            team_id,
            entity_type,
            fields = schema.fields.len(),
            links = schema.links.len(),
            "实体模式已构建"
        );

        let mut cache = self.cache.write().map_err(|_| SchemaError::LockPoisoned)?;
        Ok(Arc::clone(cache.entry(key).or_insert(schema)))
    }

    /// 新增自定义字段并清除该团队缓存
    pub fn add_custom_field(&self, def: &CustomFieldDefinition) -> SchemaResult<()> {
        self.custom_fields.insert(def)?;
        self.invalidate_team(&def.team_id)
    }

    pub fn invalidate_team(&self, team_id: &str) -> SchemaResult<()> {
        let mut cache = self.cache.write().map_err(|_| SchemaError::LockPoisoned)?;
        cache.retain(|(team, _), _| team != team_id);
        Ok(())
    }
}
