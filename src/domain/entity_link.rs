// ==========================================
// CRM 导入引擎 - 实体关联声明模型
// ==========================================
// 职责: "此列关联到另一实体，按字段 X 匹配，未匹配时可新建" 的声明式描述
// 生命周期: 每个 (实体类型, 团队) 构建一次，此后只读
// ==========================================

use crate::domain::types::{FieldType, LinkSource, MatchBehavior, StorageType};
use crate::importer::value_validator::normalize_domain;
use serde::{Deserialize, Serialize};

// ==========================================
// MatchKey - 匹配前的值规范化方式
// ==========================================
// email 小写；domain 去协议/www./路径；phone 只比较数字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    Exact,
    CaseInsensitive,
    Domain,
    Phone,
}

impl MatchKey {
    pub fn normalize(&self, value: &str) -> String {
        let v = value.trim();
        match self {
            MatchKey::Exact => v.to_string(),
            MatchKey::CaseInsensitive => v.to_lowercase(),
            MatchKey::Domain => normalize_domain(v),
            MatchKey::Phone => v.chars().filter(char::is_ascii_digit).collect(),
        }
    }
}

// ==========================================
// ImportField - 可导入字段定义
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportField {
    pub key: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub custom: bool,      // 是否为团队自定义字段
    pub unique: bool,      // 唯一字段可作为主匹配字段
    pub multi_value: bool, // 逗号分隔多值（emails / domains / multi_choice）
    pub options: Vec<String>,
    pub guesses: Vec<String>, // 表头别名
}

impl ImportField {
    pub fn new(key: &str, label: &str, field_type: FieldType) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            field_type,
            required: false,
            custom: false,
            unique: false,
            multi_value: matches!(field_type, FieldType::MultiChoice),
            options: Vec::new(),
            guesses: vec![key.to_string(), label.to_string()],
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn custom(mut self) -> Self {
        self.custom = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_value(mut self) -> Self {
        self.multi_value = true;
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_guesses(mut self, guesses: &[&str]) -> Self {
        for guess in guesses {
            if !self.guesses.iter().any(|g| g == guess) {
                self.guesses.push(guess.to_string());
            }
        }
        self
    }

    /// 按大小写不敏感查找声明的选项（Unicode 小写比较）
    pub fn find_option(&self, value: &str) -> Option<&str> {
        let needle = value.trim().to_lowercase();
        self.options
            .iter()
            .find(|o| o.to_lowercase() == needle)
            .map(String::as_str)
    }
}

// ==========================================
// MatchableField - 关联的一种匹配方式
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchableField {
    pub field: String,
    pub label: String,
    pub priority: i32, // 同一关联多列映射时高者优先
    pub behavior: MatchBehavior,
    /// 目标实体上被比较的字段
    pub target_field: String,
    pub key: MatchKey,
    pub guesses: Vec<String>,
}

impl MatchableField {
    pub fn new(field: &str, label: &str, priority: i32, behavior: MatchBehavior) -> Self {
        Self {
            field: field.to_string(),
            label: label.to_string(),
            priority,
            behavior,
            target_field: field.to_string(),
            key: MatchKey::Exact,
            guesses: Vec::new(),
        }
    }

    pub fn id() -> Self {
        Self::new("id", "Record ID", 100, MatchBehavior::MatchOnly)
    }

    pub fn email() -> Self {
        Self::new("email", "Email", 90, MatchBehavior::MatchOrCreate)
            .compare("emails", MatchKey::CaseInsensitive)
    }

    pub fn domain() -> Self {
        Self::new("domain", "Domain", 80, MatchBehavior::MatchOrCreate)
            .compare("domains", MatchKey::Domain)
    }

    pub fn phone() -> Self {
        Self::new("phone", "Phone", 70, MatchBehavior::MatchOrCreate)
            .compare("phone_numbers", MatchKey::Phone)
    }

    pub fn name() -> Self {
        Self::new("name", "Name", 10, MatchBehavior::Create)
            .compare("name", MatchKey::CaseInsensitive)
    }

    /// 指定目标字段与规范化方式
    pub fn compare(mut self, target_field: &str, key: MatchKey) -> Self {
        self.target_field = target_field.to_string();
        self.key = key;
        self
    }

    pub fn with_guesses(mut self, guesses: &[&str]) -> Self {
        self.guesses = guesses.iter().map(|g| g.to_string()).collect();
        self
    }
}

// ==========================================
// EntityLink - 可关联关系声明
// ==========================================
// 红线: matchable_fields 按 priority 降序
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLink {
    pub key: String,
    pub label: String,
    pub source: LinkSource,
    pub target_entity: String,
    pub matchable_fields: Vec<MatchableField>,
    pub storage_type: StorageType,
    pub can_create: bool,
    pub guesses: Vec<String>,
    /// ForeignKey 存储时写入的外键列
    pub foreign_key: Option<String>,
}

impl EntityLink {
    pub fn new(
        key: &str,
        label: &str,
        source: LinkSource,
        target_entity: &str,
        storage_type: StorageType,
    ) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            source,
            target_entity: target_entity.to_string(),
            matchable_fields: Vec::new(),
            storage_type,
            can_create: true,
            guesses: vec![key.to_string(), label.to_string()],
            foreign_key: None,
        }
    }

    pub fn foreign_key(mut self, column: &str) -> Self {
        self.foreign_key = Some(column.to_string());
        self
    }

    pub fn can_create(mut self, can_create: bool) -> Self {
        self.can_create = can_create;
        self
    }

    pub fn with_guesses(mut self, guesses: &[&str]) -> Self {
        for guess in guesses {
            if !self.guesses.iter().any(|g| g == guess) {
                self.guesses.push(guess.to_string());
            }
        }
        self
    }

    /// 添加匹配器并保持优先级降序（同优先级保持插入顺序）
    pub fn matcher(mut self, field: MatchableField) -> Self {
        let pos = self
            .matchable_fields
            .iter()
            .position(|m| m.priority < field.priority)
            .unwrap_or(self.matchable_fields.len());
        self.matchable_fields.insert(pos, field);
        self
    }

    pub fn find_matcher(&self, field: &str) -> Option<&MatchableField> {
        self.matchable_fields.iter().find(|m| m.field == field)
    }

    /// 最高优先级匹配器
    pub fn primary_matcher(&self) -> Option<&MatchableField> {
        self.matchable_fields.first()
    }
}

// ==========================================
// RelationshipMatcher - 列映射落到的 (关联, 匹配器) 对
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipMatcher {
    pub source: String, // CSV 表头
    pub link: EntityLink,
    pub matcher: MatchableField,
}

impl RelationshipMatcher {
    pub fn behavior(&self) -> MatchBehavior {
        self.matcher.behavior
    }

    pub fn priority(&self) -> i32 {
        self.matcher.priority
    }

    /// 未匹配时是否新建
    pub fn creates_when_missing(&self) -> bool {
        match self.matcher.behavior {
            MatchBehavior::MatchOnly => false,
            MatchBehavior::MatchOrCreate => self.link.can_create,
            MatchBehavior::Create => true,
        }
    }
}
