// ==========================================
// CRM 导入引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写
// 存储: config_kv 表 (scope_id + key → value)，当前只使用 global 作用域
// ==========================================

use crate::config::import_config_trait::{ImportConfig, ImportConfigReader};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const GLOBAL_SCOPE: &str = "global";

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&guard)?;
        }
        Ok(Self { conn })
    }

    /// 读取 global scope 的配置值
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_global_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = ?1 AND key = ?2",
                params![GLOBAL_SCOPE, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global scope 配置（存在则覆盖）
    pub fn set_config(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?3",
            params![GLOBAL_SCOPE, key, value],
        )?;
        tracing::info!(key, value, "配置已更新");
        Ok(())
    }

    /// 读取并解析配置，缺失或格式错误时回落默认值
    fn get_config_or_default<T>(&self, key: &str, default: T) -> ConfigResult<T>
    where
        T: FromStr + std::fmt::Debug,
    {
        let Some(raw) = self.get_global_config_value(key)? else {
            return Ok(default);
        };
        match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => {
                tracing::warn!(key, raw = %raw, default = ?default, "配置值格式错误，使用默认值");
                Ok(default)
            }
        }
    }
}

#[async_trait]
impl ImportConfigReader for ConfigManager {
    async fn load_import_config(&self) -> ConfigResult<ImportConfig> {
        let d = ImportConfig::default();

        let threshold = self.get_config_or_default(
            config_keys::INFERENCE_CONFIDENCE_THRESHOLD,
            d.inference_confidence_threshold,
        )?;
        let threshold = if (0.0..=1.0).contains(&threshold) {
            threshold
        } else {
            tracing::warn!(threshold, "推断阈值超出 [0, 1]，使用默认值");
            d.inference_confidence_threshold
        };

        Ok(ImportConfig {
            session_ttl_hours: self
                .get_config_or_default(config_keys::SESSION_TTL_HOURS, d.session_ttl_hours)?
                .max(1),
            row_chunk_size: self
                .get_config_or_default(config_keys::ROW_CHUNK_SIZE, d.row_chunk_size)?
                .max(1),
            inference_min_samples: self
                .get_config_or_default(config_keys::INFERENCE_MIN_SAMPLES, d.inference_min_samples)?,
            inference_confidence_threshold: threshold,
            preview_sample_size: self
                .get_config_or_default(config_keys::PREVIEW_SAMPLE_SIZE, d.preview_sample_size)?,
            analysis_page_size: self
                .get_config_or_default(config_keys::ANALYSIS_PAGE_SIZE, d.analysis_page_size)?
                .max(1),
            default_locale: self
                .get_global_config_value(config_keys::DEFAULT_LOCALE)?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.default_locale),
        })
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 会话
    pub const SESSION_TTL_HOURS: &str = "session_ttl_hours";

    // 后台批次
    pub const ROW_CHUNK_SIZE: &str = "row_chunk_size";

    // 类型推断
    pub const INFERENCE_MIN_SAMPLES: &str = "inference_min_samples";
    pub const INFERENCE_CONFIDENCE_THRESHOLD: &str = "inference_confidence_threshold";

    // 审核 / 预览
    pub const PREVIEW_SAMPLE_SIZE: &str = "preview_sample_size";
    pub const ANALYSIS_PAGE_SIZE: &str = "analysis_page_size";

    // 本地化
    pub const DEFAULT_LOCALE: &str = "default_locale";
}
