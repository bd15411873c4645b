// ==========================================
// CRM 导入引擎 - CRM 记录模型
// ==========================================
// 职责: 导入目标实体（公司/联系人/商机/任务/笔记）的通用记录表示
// 存储: crm_record (fields_json) + crm_custom_field_value + crm_record_link
// ==========================================

use crate::domain::types::CreationSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// CRM 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub team_id: String,
    pub entity_type: String,
    pub fields: BTreeMap<String, Value>,        // 内建字段 + 外键列
    pub custom_fields: BTreeMap<String, Value>, // 自定义字段值
    pub creation_source: CreationSource,
    pub creator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// 构造一条尚未保存的导入记录
    pub fn new_import(team_id: &str, entity_type: &str, creator_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            entity_type: entity_type.to_string(),
            fields: BTreeMap::new(),
            custom_fields: BTreeMap::new(),
            creation_source: CreationSource::Import,
            creator_id: Some(creator_id.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    /// 读取字段（内建优先，其次自定义）
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).or_else(|| self.custom_fields.get(key))
    }

    /// 读取字段文本值
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// 多态关联（MorphToMany）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLink {
    pub owner_id: String,
    pub relationship: String,
    pub target_id: String,
}
