// ==========================================
// CRM 导入引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// 时间: 统一存为 UTC RFC3339（毫秒，Z 结尾），可按字符串比较先后
// ==========================================

pub mod error;
pub mod import_store;
pub mod record_repo;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use import_store::{ActionCounts, ColumnCell, ImportStore};
pub use record_repo::{RecordRepository, RowWritePlan, SqliteRecordRepository};

use chrono::{DateTime, SecondsFormat, Utc};

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::SerializationError {
            field: "timestamp".to_string(),
            message: format!("{}: {}", raw, e),
        })
}
