// ==========================================
// CRM 导入引擎 - 作业层
// ==========================================
// 职责: 列分析 / 行匹配 / 关联解析 / 提交执行 / 结束通知
// 红线: 作业不拼 SQL，读写全部经由 ImportStore 与 RecordRepository
// 红线: 依赖显式注入（JobContext），不做全局查找
// ==========================================

pub mod batch;
pub mod column_analyzer;
pub mod entity_link_resolver;
pub mod error;
pub mod execute_import;
pub mod match_resolver;
pub mod notifier;
pub mod storage_strategy;

// 重导出核心作业
pub use batch::{chunk_ranges, BatchReporter, JobContext};
pub use column_analyzer::{paginate, validation_field, validator_for, ColumnAnalyzer};
pub use entity_link_resolver::{ColumnChunkReport, EntityLinkResolver, LinkOutcome, ValidateColumnJob};
pub use error::{JobError, JobResult};
pub use execute_import::ExecuteImportJob;
pub use match_resolver::{MatchResolver, ResolveMatchesJob};
pub use notifier::{ImportNotification, ImportOutcome, LogNotifier, Notifier, RecordingNotifier};
pub use storage_strategy::{
    strategy_for, CustomFieldValueStorage, ForeignKeyStorage, MorphToManyStorage, StorageStrategy,
};
