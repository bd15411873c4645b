// ==========================================
// CRM 导入引擎 - API 层错误类型
// ==========================================
// 职责: 汇总各层错误，转换为面向调用方的明确原因
// ==========================================

use crate::config::ImportConfig;
use crate::engine::error::JobError;
use crate::importer::error::ImportError;
use crate::repository::error::RepositoryError;
use crate::schema::{MappingIssue, SchemaError};
use thiserror::Error;

/// API 层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("列映射无效: {} 个问题", .0.len())]
    InvalidMapping(Vec<MappingIssue>),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("会话 {session_id} 已有进行中的批次: {batch_id}")]
    BatchInProgress { session_id: String, batch_id: String },

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    // ==========================================
    // 导入 / 作业错误
    // ==========================================
    #[error("文件导入失败: {0}")]
    ImportError(String),

    #[error("后台作业失败: {0}")]
    JobFailed(String),

    #[error("配置读取失败: {0}")]
    ConfigError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::DatabaseTransactionError(msg) => ApiError::DatabaseTransactionError(msg),
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("外键约束违反: {}", msg))
            }
            RepositoryError::InvalidStateTransition { from, to } => {
                ApiError::InvalidStateTransition { from, to }
            }
            RepositoryError::BatchInProgress { session_id, batch_id } => {
                ApiError::BatchInProgress { session_id, batch_id }
            }
            RepositoryError::BusinessRuleViolation(msg) => ApiError::BusinessRuleViolation(msg),
            RepositoryError::SerializationError { field, message } => {
                ApiError::InternalError(format!("字段 {} 序列化失败: {}", field, message))
            }
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::FileNotFound(path) => ApiError::NotFound(path),
            other => ApiError::ImportError(other.to_string()),
        }
    }
}

impl From<SchemaError> for ApiError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnknownEntity(entity) => {
                ApiError::InvalidInput(format!("不支持的实体类型: {}", entity))
            }
            SchemaError::LockPoisoned => ApiError::InternalError(err.to_string()),
            SchemaError::Repository(e) => e.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::SessionNotFound(id) => ApiError::NotFound(format!("导入会话(id={})不存在", id)),
            JobError::Schema(e) => e.into(),
            JobError::Repository(e) => e.into(),
            other => ApiError::JobFailed(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::InternalError(format!("后台任务异常退出: {}", err))
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

/// 配置读取失败时回落默认配置的辅助
pub(crate) fn config_or_default(
    loaded: Result<ImportConfig, Box<dyn std::error::Error + Send + Sync>>,
) -> ImportConfig {
    loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "导入配置读取失败，使用默认配置");
        ImportConfig::default()
    })
}
