// ==========================================
// CRM 导入引擎 - 核心库
// ==========================================
// 职责: CSV/XLSX 批量导入 CRM 记录
// 流程: 列映射 → 值审核与修正 → 记录匹配 / 关联解析 → 事务化提交
// 技术栈: Rust + SQLite + tokio
// ==========================================

// 初始化国际化系统
rust_i18n::i18n!("locales", fallback = "en");

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 值对象与枚举
pub mod domain;

// 模式层 - 可导入字段 / 可关联关系
pub mod schema;

// 导入层 - 纯逻辑（匹配、推断、格式、校验、文件解析）
pub mod importer;

// 数据仓储层 - 数据访问
pub mod repository;

// 作业层 - 分析 / 解析 / 执行
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// API 层 - 业务接口
pub mod api;

// 数据库基础设施（连接初始化/PRAGMA 统一/建表）
pub mod db;

// 日志系统
pub mod logging;

// 国际化
pub mod i18n;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{FieldType, ImportStatus, MatchAction, MatchBehavior, StorageType};

// 领域实体
pub use domain::{ColumnData, ColumnMappings, ImportResults, ImportRow, ImportSession, Record};

// 作业
pub use engine::{ExecuteImportJob, LogNotifier, MatchResolver, Notifier};

// API
pub use api::{ApiError, ApiResult, ImportApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "CRM 导入引擎";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
