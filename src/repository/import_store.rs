// ==========================================
// CRM 导入引擎 - 导入会话工作集仓储
// ==========================================
// 存储: import_session / import_row / import_failed_row
// 红线: 会话数据只归属一个 session_id，不跨会话共享
// 红线: 会话过期（expires_at < now）即视为不存在
// ==========================================

mod core;
mod queries;


pub use core::{ImportStore, DEFAULT_SESSION_TTL_HOURS};
pub use queries::{ActionCounts, ColumnCell};
