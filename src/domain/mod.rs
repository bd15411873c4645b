// ==========================================
// CRM 导入引擎 - 领域模型层
// ==========================================
// 职责: 定义导入会话、映射、关联声明、记录等值对象与枚举
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod analysis;
pub mod entity_link;
pub mod import;
pub mod mapping;
pub mod record;
pub mod types;

// 重导出核心类型
pub use analysis::{
    AnalysisPage, AnalysisQuery, ColumnAnalysis, SortDirection, SortField, UniqueValue,
    ValueFilter, ValueIssue,
};
pub use entity_link::{EntityLink, ImportField, MatchKey, MatchableField, RelationshipMatcher};
pub use import::{
    BatchProgress, CellIssue, FailedRow, ImportResults, ImportRow, ImportSession,
    MatchResolution, NewSession, RelationshipAction, RelationshipMatch, RowOutcome,
};
pub use mapping::{ColumnData, ColumnMappings};
pub use record::{Record, RecordLink};
pub use types::{
    BatchKind, CreationSource, FieldType, ImportStatus, IssueSeverity, IssueType, LinkSource,
    MatchAction, MatchBehavior, StorageType,
};
