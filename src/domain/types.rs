// ==========================================
// CRM 导入引擎 - 领域类型定义
// ==========================================
// 职责: 导入流水线中所有枚举型状态/动作/类别
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 导入会话状态 (Import Status)
// ==========================================
// 流转: Mapping → Reviewing → Importing → Completed | Failed
// 红线: 只允许单向前进，唯一例外是用户显式"返回上一步"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Mapping,   // 列映射
    Reviewing, // 值审核
    Importing, // 执行中
    Completed, // 已完成
    Failed,    // 失败
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Mapping => "MAPPING",
            ImportStatus::Reviewing => "REVIEWING",
            ImportStatus::Importing => "IMPORTING",
            ImportStatus::Completed => "COMPLETED",
            ImportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MAPPING" => Some(ImportStatus::Mapping),
            "REVIEWING" => Some(ImportStatus::Reviewing),
            "IMPORTING" => Some(ImportStatus::Importing),
            "COMPLETED" => Some(ImportStatus::Completed),
            "FAILED" => Some(ImportStatus::Failed),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    /// 前进方向的合法流转
    ///
    /// # 说明
    /// - 同状态重复写入视为合法（幂等）
    /// - Importing 之后只能进入终态
    pub fn can_advance_to(&self, next: ImportStatus) -> bool {
        use ImportStatus as S;
        if *self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (S::Mapping, S::Reviewing)
                | (S::Reviewing, S::Importing)
                | (S::Mapping, S::Importing)
                | (S::Importing, S::Completed)
                | (S::Importing, S::Failed)
                | (S::Mapping, S::Failed)
                | (S::Reviewing, S::Failed)
        )
    }

    /// 用户"返回上一步"是否允许
    pub fn can_go_back_to(&self, target: ImportStatus) -> bool {
        matches!(
            (self, target),
            (ImportStatus::Reviewing, ImportStatus::Mapping)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 行匹配动作 (Match Action)
// ==========================================
// 红线: matched_id 非空 当且仅当 action == Update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchAction {
    Create, // 新建
    Update, // 更新已有记录
    Skip,   // 跳过
}

impl MatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAction::Create => "CREATE",
            MatchAction::Update => "UPDATE",
            MatchAction::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(MatchAction::Create),
            "UPDATE" => Some(MatchAction::Update),
            "SKIP" => Some(MatchAction::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for MatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 匹配器行为 (Match Behavior)
// ==========================================
// 决定"未匹配到"时的处理: 静默跳过 / 视 can_create 新建 / 总是新建
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchBehavior {
    MatchOnly,     // 仅匹配（如 id）
    MatchOrCreate, // 匹配，否则新建（如 email/domain/phone）
    Create,        // 总是新建（如 name）
}

// ==========================================
// 关联存储方式 (Storage Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    ForeignKey,       // 外键列，保存前写入
    MorphToMany,      // 多态多对多，保存后 attach
    CustomFieldValue, // 自定义字段值（record 类型）
}

impl StorageType {
    /// 是否需要宿主记录先落库（拿到 id）
    pub fn requires_saved_owner(&self) -> bool {
        !matches!(self, StorageType::ForeignKey)
    }
}

// ==========================================
// 关联来源 (Link Source)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkSource {
    Relationship, // 模型内建关系
    CustomField,  // record 类型自定义字段
}

// ==========================================
// 问题严重度 / 问题类别
// ==========================================
// 红线: 校验问题不阻断任何流水线阶段，只有值级跳过会影响执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Invalid,
    Ambiguous,
    FormatMismatch,
}

// ==========================================
// 字段类型 (Field Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Phone,
    Url,
    Domain,
    Date,
    DateTime,
    Number,
    Choice,
    MultiChoice,
    Record,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::Domain => "domain",
            FieldType::Date => "date",
            FieldType::DateTime => "date_time",
            FieldType::Number => "number",
            FieldType::Choice => "choice",
            FieldType::MultiChoice => "multi_choice",
            FieldType::Record => "record",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "string" | "textarea" => Some(FieldType::Text),
            "email" => Some(FieldType::Email),
            "phone" => Some(FieldType::Phone),
            "url" | "link" => Some(FieldType::Url),
            "domain" => Some(FieldType::Domain),
            "date" => Some(FieldType::Date),
            "datetime" | "date_time" | "timestamp" => Some(FieldType::DateTime),
            "number" | "numeric" | "currency" => Some(FieldType::Number),
            "choice" | "select" => Some(FieldType::Choice),
            "multi_choice" | "multi_select" | "tags" => Some(FieldType::MultiChoice),
            "record" => Some(FieldType::Record),
            _ => None,
        }
    }

    /// 是否为日期类字段
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

// ==========================================
// 记录来源标记 (Creation Source)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreationSource {
    Web,
    Import,
    Api,
    System,
}

impl CreationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationSource::Web => "WEB",
            CreationSource::Import => "IMPORT",
            CreationSource::Api => "API",
            CreationSource::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "IMPORT" => CreationSource::Import,
            "API" => CreationSource::Api,
            "SYSTEM" => CreationSource::System,
            _ => CreationSource::Web,
        }
    }
}

// ==========================================
// 后台批次类型 (Batch Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchKind {
    ResolveMatches, // 行匹配解析
    ValidateColumn, // 列校验 + 关联解析
    Execute,        // 提交执行
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::ResolveMatches => "RESOLVE_MATCHES",
            BatchKind::ValidateColumn => "VALIDATE_COLUMN",
            BatchKind::Execute => "EXECUTE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESOLVE_MATCHES" => Some(BatchKind::ResolveMatches),
            "VALIDATE_COLUMN" => Some(BatchKind::ValidateColumn),
            "EXECUTE" => Some(BatchKind::Execute),
            _ => None,
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_transitions() {
        assert!(ImportStatus::Mapping.can_advance_to(ImportStatus::Reviewing));
        assert!(ImportStatus::Reviewing.can_advance_to(ImportStatus::Importing));
        assert!(ImportStatus::Importing.can_advance_to(ImportStatus::Completed));
        assert!(ImportStatus::Importing.can_advance_to(ImportStatus::Failed));

        assert!(!ImportStatus::Completed.can_advance_to(ImportStatus::Importing));
        assert!(!ImportStatus::Importing.can_advance_to(ImportStatus::Reviewing));
        assert!(!ImportStatus::Failed.can_advance_to(ImportStatus::Failed));
    }

    #[test]
    fn test_status_go_back_only_from_review() {
        assert!(ImportStatus::Reviewing.can_go_back_to(ImportStatus::Mapping));
        assert!(!ImportStatus::Importing.can_go_back_to(ImportStatus::Reviewing));
        assert!(!ImportStatus::Completed.can_go_back_to(ImportStatus::Mapping));
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            ImportStatus::Mapping,
            ImportStatus::Reviewing,
            ImportStatus::Importing,
            ImportStatus::Completed,
            ImportStatus::Failed,
        ] {
            assert_eq!(ImportStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ImportStatus::parse("unknown"), None);
    }

    #[test]
    fn test_field_type_aliases() {
        assert_eq!(FieldType::parse("Multi_Select"), Some(FieldType::MultiChoice));
        assert_eq!(FieldType::parse("currency"), Some(FieldType::Number));
        assert_eq!(FieldType::parse("??"), None);
        assert!(FieldType::DateTime.is_temporal());
    }
}
