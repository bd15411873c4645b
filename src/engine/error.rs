// ==========================================
// CRM 导入引擎 - 作业层错误类型
// ==========================================
// 分类:
// - 行级失败（RowExecutionFailure）: 捕获后记入 failed_rows，继续下一行
// - 会话级失败（SessionFailure）: 中止整个作业，会话置为 Failed
// ==========================================

use crate::repository::error::RepositoryError;
use crate::schema::SchemaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    // ===== 会话级 =====
    #[error("导入会话不存在或已过期: {0}")]
    SessionNotFound(String),

    #[error("批次已取消: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    // ===== 行级 =====
    #[error("缺少必填字段: {0}")]
    MissingRequiredField(String),

    #[error("关联 {relationship} 无法解析: {message}")]
    RelationshipError {
        relationship: String,
        message: String,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled(_))
    }

    /// 是否只影响当前行（其余错误中止整个作业）
    pub fn is_row_level(&self) -> bool {
        match self {
            JobError::SessionNotFound(_) | JobError::Cancelled(_) | JobError::Schema(_) => false,
            JobError::Repository(e) => !matches!(
                e,
                RepositoryError::LockError(_) | RepositoryError::DatabaseConnectionError(_)
            ),
            JobError::MissingRequiredField(_)
            | JobError::RelationshipError { .. }
            | JobError::Other(_) => true,
        }
    }
}


/// Result 类型别名
pub type JobResult<T> = Result<T, JobError>;
