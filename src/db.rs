// ==========================================
// CRM 导入引擎 - SQLite 连接初始化与建表
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键、busy_timeout）
// - init_schema 幂等建表，并记录 schema_version
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要"每个连接"单独开启
/// - busy_timeout 需要"每个连接"单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (scope_id, key)
);

-- 导入会话
CREATE TABLE IF NOT EXISTS import_session (
    session_id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    status TEXT NOT NULL,
    headers_json TEXT NOT NULL DEFAULT '[]',
    row_count INTEGER NOT NULL DEFAULT 0,
    mappings_json TEXT NOT NULL DEFAULT '[]',
    results_json TEXT,
    error_message TEXT,
    unresolved_links_json TEXT NOT NULL DEFAULT '{}',
    active_batch_id TEXT,
    batch_kind TEXT,
    batch_total INTEGER NOT NULL DEFAULT 0,
    batch_processed INTEGER NOT NULL DEFAULT 0,
    batch_active INTEGER NOT NULL DEFAULT 0,
    heartbeat_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_import_session_expires ON import_session(expires_at);

-- 会话原始行
CREATE TABLE IF NOT EXISTS import_row (
    session_id TEXT NOT NULL REFERENCES import_session(session_id) ON DELETE CASCADE,
    row_number INTEGER NOT NULL,
    raw_json TEXT NOT NULL,
    corrections_json TEXT NOT NULL DEFAULT '{}',
    skipped_json TEXT NOT NULL DEFAULT '{}',
    validation_json TEXT NOT NULL DEFAULT '{}',
    match_action TEXT,
    matched_id TEXT,
    relationships_json TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (session_id, row_number),
    CHECK ((match_action IS 'UPDATE') = (matched_id IS NOT NULL))
);

-- 执行失败行
CREATE TABLE IF NOT EXISTS import_failed_row (
    session_id TEXT NOT NULL REFERENCES import_session(session_id) ON DELETE CASCADE,
    row_number INTEGER NOT NULL,
    error TEXT NOT NULL,
    PRIMARY KEY (session_id, row_number)
);

-- 团队自定义字段定义
CREATE TABLE IF NOT EXISTS crm_custom_field (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    code TEXT NOT NULL,
    label TEXT NOT NULL,
    field_type TEXT NOT NULL,
    options_json TEXT NOT NULL DEFAULT '[]',
    is_required INTEGER NOT NULL DEFAULT 0,
    is_unique INTEGER NOT NULL DEFAULT 0,
    target_entity TEXT,
    UNIQUE (team_id, entity_type, code)
);

-- CRM 记录
CREATE TABLE IF NOT EXISTS crm_record (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    fields_json TEXT NOT NULL DEFAULT '{}',
    custom_fields_json TEXT NOT NULL DEFAULT '{}',
    creation_source TEXT NOT NULL,
    creator_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_crm_record_team_entity ON crm_record(team_id, entity_type);

-- record 类型自定义字段值
CREATE TABLE IF NOT EXISTS crm_custom_field_value (
    record_id TEXT NOT NULL REFERENCES crm_record(id) ON DELETE CASCADE,
    field_code TEXT NOT NULL,
    target_id TEXT NOT NULL REFERENCES crm_record(id) ON DELETE CASCADE,
    PRIMARY KEY (record_id, field_code)
);

-- 多态多对多关联
CREATE TABLE IF NOT EXISTS crm_record_link (
    owner_id TEXT NOT NULL REFERENCES crm_record(id) ON DELETE CASCADE,
    relationship TEXT NOT NULL,
    target_id TEXT NOT NULL REFERENCES crm_record(id) ON DELETE CASCADE,
    PRIMARY KEY (owner_id, relationship, target_id)
);
"#;

/// 幂等建表并登记 schema_version
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![CURRENT_SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// 打开数据库并确保表结构就绪
pub fn open_and_init(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = open_sqlite_connection(db_path)?;
    init_schema(&conn)?;
    match read_schema_version(&conn)? {
        Some(v) if v > CURRENT_SCHEMA_VERSION => {
            tracing::warn!(
                db_version = v,
                expected = CURRENT_SCHEMA_VERSION,
                "数据库 schema_version 高于当前程序版本"
            );
        }
        _ => {}
    }
    Ok(conn)
}

/// 默认数据库路径
///
/// # 返回
/// - 环境变量 CRM_IMPORT_DB_PATH（非空时）
/// - 否则: 用户数据目录/crm-import/crm_import.db
/// - 取不到用户数据目录时: ./crm_import.db
pub fn default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var("CRM_IMPORT_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./crm_import.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("crm-import");
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("crm_import.db");
        }
    }
    path.to_string_lossy().to_string()
}
