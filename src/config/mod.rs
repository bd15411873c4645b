// ==========================================
// CRM 导入引擎 - 配置层
// ==========================================
// 职责: 系统配置管理，缺省值 + config_kv 覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod import_config_trait;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use import_config_trait::{ImportConfig, ImportConfigReader};
