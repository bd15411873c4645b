// ==========================================
// CRM 导入引擎 - 导入会话领域模型
// ==========================================
// 职责: 导入会话元数据 / 原始行 / 行解析结果 / 执行结果
// 生命周期: 上传时创建 → 审核期间逐字段修改 → 解析期间整体改写 → 执行期间只读
// ==========================================

use crate::domain::mapping::ColumnMappings;
use crate::domain::types::{BatchKind, ImportStatus, IssueSeverity, IssueType, MatchAction};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ==========================================
// RelationshipMatch - 单行单关联的解析结果
// ==========================================
// 红线: id / name 恰有一个非空，与 action 对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipAction {
    Existing, // 关联已有记录
    Create,   // 执行时新建（运行内去重）
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipMatch {
    pub relationship: String,
    pub action: RelationshipAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 产生该结果的匹配器字段（新建时写入该字段）
    pub matcher: String,
}

impl RelationshipMatch {
    pub fn existing(
        relationship: impl Into<String>,
        id: impl Into<String>,
        matcher: impl Into<String>,
    ) -> Self {
        Self {
            relationship: relationship.into(),
            action: RelationshipAction::Existing,
            id: Some(id.into()),
            name: None,
            matcher: matcher.into(),
        }
    }

    pub fn create(
        relationship: impl Into<String>,
        name: impl Into<String>,
        matcher: impl Into<String>,
    ) -> Self {
        Self {
            relationship: relationship.into(),
            action: RelationshipAction::Create,
            id: None,
            name: Some(name.into()),
            matcher: matcher.into(),
        }
    }

    /// 校验 id/name 与 action 一致
    pub fn is_consistent(&self) -> bool {
        match self.action {
            RelationshipAction::Existing => self.id.is_some() && self.name.is_none(),
            RelationshipAction::Create => self.name.is_some() && self.id.is_none(),
        }
    }
}

// ==========================================
// MatchResolution - 行级匹配结论
// ==========================================
// 以构造保证 matched_id ⇔ Update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResolution {
    Create,
    Update(String),
    Skip,
}

impl MatchResolution {
    pub fn action(&self) -> MatchAction {
        match self {
            MatchResolution::Create => MatchAction::Create,
            MatchResolution::Update(_) => MatchAction::Update,
            MatchResolution::Skip => MatchAction::Skip,
        }
    }

    pub fn matched_id(&self) -> Option<&str> {
        match self {
            MatchResolution::Update(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

// ==========================================
// CellIssue - 行内单元格校验问题
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellIssue {
    pub message: String,
    pub severity: IssueSeverity,
    pub issue_type: IssueType,
}

// ==========================================
// ImportRow - 原始行
// ==========================================
// 主键: (session_id, row_number)
// 红线: matched_id 非空 当且仅当 match_action == Update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRow {
    pub row_number: i64,                        // 1 起，已扣除表头偏移
    pub raw_data: IndexMap<String, String>,     // 表头 → 原始值（保持列顺序）
    pub corrections: BTreeMap<String, String>,  // 列 → 修正值（稀疏）
    pub skipped: BTreeMap<String, bool>,        // 列 → 是否跳过（稀疏）
    pub validation: BTreeMap<String, CellIssue>, // 列 → 校验问题（稀疏）
    pub match_action: Option<MatchAction>,
    pub matched_id: Option<String>,
    pub relationships: Vec<RelationshipMatch>,
}

impl ImportRow {
    pub fn new(row_number: i64, raw_data: IndexMap<String, String>) -> Self {
        Self {
            row_number,
            raw_data,
            corrections: BTreeMap::new(),
            skipped: BTreeMap::new(),
            validation: BTreeMap::new(),
            match_action: None,
            matched_id: None,
            relationships: Vec::new(),
        }
    }

    /// 原始值
    pub fn raw(&self, source: &str) -> Option<&str> {
        self.raw_data.get(source).map(String::as_str)
    }

    pub fn is_skipped(&self, source: &str) -> bool {
        self.skipped.get(source).copied().unwrap_or(false)
    }

    /// 生效值: 修正值优先于原始值；被跳过的列返回 None
    pub fn value(&self, source: &str) -> Option<&str> {
        if self.is_skipped(source) {
            return None;
        }
        self.corrections
            .get(source)
            .map(String::as_str)
            .or_else(|| self.raw(source))
    }

    /// 生效值（去空白，空串视为缺失）
    pub fn present_value(&self, source: &str) -> Option<&str> {
        self.value(source).map(str::trim).filter(|v| !v.is_empty())
    }

    /// 当前匹配结论
    pub fn match_resolution(&self) -> Option<MatchResolution> {
        match (self.match_action?, self.matched_id.as_ref()) {
            (MatchAction::Update, Some(id)) => Some(MatchResolution::Update(id.clone())),
            (MatchAction::Update, None) => None,
            (MatchAction::Create, _) => Some(MatchResolution::Create),
            (MatchAction::Skip, _) => Some(MatchResolution::Skip),
        }
    }

    /// 写入匹配结论（整体替换）
    pub fn apply_resolution(&mut self, resolution: &MatchResolution) {
        self.match_action = Some(resolution.action());
        self.matched_id = resolution.matched_id().map(str::to_string);
    }

    /// 清空匹配结论
    pub fn reset_resolution(&mut self) {
        self.match_action = None;
        self.matched_id = None;
    }

    /// 指定关联的解析结果
    pub fn relationships_for(&self, link: &str) -> impl Iterator<Item = &RelationshipMatch> {
        let link = link.to_string();
        self.relationships
            .iter()
            .filter(move |m| m.relationship == link)
    }
}

// ==========================================
// ImportResults - 执行结果汇总
// ==========================================
// 红线: 每一行恰好落入 created/updated/skipped/failed 之一
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResults {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl ImportResults {
    pub fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Created => self.created += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &ImportResults) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// 执行失败行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    pub row_number: i64,
    pub error: String,
}

// ==========================================
// BatchProgress - 后台批次进度（心跳读模型）
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub kind: BatchKind,
    pub total: u64,
    pub processed: u64,
    pub active: bool,
    pub heartbeat_at: DateTime<Utc>,
}

// ==========================================
// NewSession - 创建会话参数
// ==========================================
#[derive(Debug, Clone)]
pub struct NewSession {
    pub team_id: String,
    pub user_id: String,
    pub entity_type: String,
    pub original_filename: String,
}

// ==========================================
// ImportSession - 会话元数据
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub session_id: String,
    pub team_id: String,
    pub user_id: String,
    pub entity_type: String,
    pub original_filename: String,
    pub status: ImportStatus,
    pub headers: Vec<String>,
    pub row_count: i64,
    pub mappings: ColumnMappings,
    pub results: Option<ImportResults>,
    pub error_message: Option<String>,
    pub batch: Option<BatchProgress>,
    /// 关联 key → 未能解析的非空值行数
    pub unresolved_links: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ImportSession {
    /// 当前是否有活动批次
    pub fn has_active_batch(&self) -> bool {
        self.batch.as_ref().map(|b| b.active).unwrap_or(false)
    }
}
