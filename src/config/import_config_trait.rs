// ==========================================
// CRM 导入引擎 - 导入配置读取 Trait
// ==========================================
// 职责: 定义导入流水线所需的配置快照与读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

// ==========================================
// ImportConfig - 已解析的配置快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// 会话存活时长（小时），心跳写入时顺延
    pub session_ttl_hours: i64,
    /// 后台批次分块行数
    pub row_chunk_size: usize,
    /// 类型推断最小样本数
    pub inference_min_samples: usize,
    /// 类型推断置信度阈值（含等于）
    pub inference_confidence_threshold: f64,
    /// 预览样本行数
    pub preview_sample_size: usize,
    /// 列分析默认每页条数
    pub analysis_page_size: usize,
    /// 默认语言
    pub default_locale: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: 24,
            row_chunk_size: 500,
            inference_min_samples: 4,
            inference_confidence_threshold: 0.7,
            preview_sample_size: 10,
            analysis_page_size: 50,
            default_locale: "en".to_string(),
        }
    }
}

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    /// 读取完整导入配置
    ///
    /// # 说明
    /// - 缺失或格式错误的键回落到默认值
    async fn load_import_config(&self) -> Result<ImportConfig, Box<dyn Error + Send + Sync>>;
}
