// ==========================================
// ConfigManager 集成测试
// ==========================================
// 测试目标: 验证配置读取、覆写与回落默认值
// ==========================================


use crm_import::api::ImportApi;
use crm_import::config::{config_keys, ConfigManager, ImportConfig, ImportConfigReader};
use crm_import::engine::LogNotifier;
use std::sync::Arc;
use test_helpers::create_test_db;

#[tokio::test]
async fn test_config_manager_creation() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");

    let config_manager = ConfigManager::new(&db_path);
    assert!(
        config_manager.is_ok(),
        "ConfigManager should be created successfully"
    );
}

#[tokio::test]
async fn test_empty_table_yields_defaults() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let config_manager = ConfigManager::new(&db_path).expect("Failed to create ConfigManager");

    let config = config_manager
        .load_import_config()
        .await
        .expect("Should load config");
    assert_eq!(config, ImportConfig::default());
}

#[tokio::test]
async fn test_overrides_and_invalid_values() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let config_manager = ConfigManager::new(&db_path).expect("Failed to create ConfigManager");

    config_manager.set_config(config_keys::ROW_CHUNK_SIZE, "25").unwrap();
    config_manager.set_config(config_keys::DEFAULT_LOCALE, "zh-CN").unwrap();
    // 非法值回落默认
    config_manager
        .set_config(config_keys::INFERENCE_CONFIDENCE_THRESHOLD, "1.5")
        .unwrap();
    config_manager
        .set_config(config_keys::ANALYSIS_PAGE_SIZE, "many")
        .unwrap();

    let config = config_manager.load_import_config().await.unwrap();
    let defaults = ImportConfig::default();
    assert_eq!(config.row_chunk_size, 25);
    assert_eq!(config.default_locale, "zh-CN");
    assert_eq!(
        config.inference_confidence_threshold,
        defaults.inference_confidence_threshold
    );
    assert_eq!(config.analysis_page_size, defaults.analysis_page_size);

    // 覆盖写入
    config_manager.set_config(config_keys::ROW_CHUNK_SIZE, "40").unwrap();
    assert_eq!(
        config_manager
            .get_global_config_value(config_keys::ROW_CHUNK_SIZE)
            .unwrap()
            .as_deref(),
        Some("40")
    );
}

#[tokio::test]
async fn test_api_picks_up_stored_config() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    {
        let config_manager = ConfigManager::new(&db_path).unwrap();
        config_manager.set_config(config_keys::ROW_CHUNK_SIZE, "1").unwrap();
        config_manager.set_config(config_keys::SESSION_TTL_HOURS, "0").unwrap();
    }

    let api = ImportApi::open(&db_path, Arc::new(LogNotifier))
        .await
        .expect("Failed to open ImportApi");
    assert_eq!(api.config().row_chunk_size, 1);
    // 存活时长下限 1 小时
    assert_eq!(api.config().session_ttl_hours, 1);
}
