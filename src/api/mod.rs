// ==========================================
// CRM 导入引擎 - API 层
// ==========================================
// 职责: 提供导入会话业务 API，供 CLI / 上层 UI 调用
// ==========================================

pub mod error;
pub mod import_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use import_api::{ImportApi, ImportPreview, StatusReport};
