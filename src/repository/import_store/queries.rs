use super::core::ImportStore;
use crate::domain::import::{BatchProgress, CellIssue, FailedRow, ImportRow, ImportSession};
use crate::domain::mapping::ColumnMappings;
use crate::domain::types::{BatchKind, ImportStatus, MatchAction};
use crate::repository::error::{from_json, RepositoryError, RepositoryResult};
use crate::repository::{now_ts, parse_ts};
use chrono::Utc;
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;

/// 列分析所需的单元格视图
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCell {
    pub row_number: i64,
    pub raw: String,
    pub correction: Option<String>,
    pub skipped: bool,
    pub issue: Option<CellIssue>,
}

/// 行匹配结论计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub create: u64,
    pub update: u64,
    pub skip: u64,
    pub unresolved: u64,
}

const SESSION_COLUMNS: &str = r#"
    session_id, team_id, user_id, entity_type, original_filename, status,
    headers_json, row_count, mappings_json, results_json, error_message,
    unresolved_links_json, active_batch_id, batch_kind, batch_total, batch_processed,
    batch_active, heartbeat_at, created_at, updated_at, expires_at
"#;

const ROW_COLUMNS: &str = r#"
    row_number, raw_json, corrections_json, skipped_json, validation_json,
    match_action, matched_id, relationships_json
"#;

/// import_session 行的原始列值
struct SessionColumns {
    session_id: String,
    team_id: String,
    user_id: String,
    entity_type: String,
    original_filename: String,
    status: String,
    headers_json: String,
    row_count: i64,
    mappings_json: String,
    results_json: Option<String>,
    error_message: Option<String>,
    unresolved_links_json: String,
    active_batch_id: Option<String>,
    batch_kind: Option<String>,
    batch_total: i64,
    batch_processed: i64,
    batch_active: bool,
    heartbeat_at: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: String,
}

impl SessionColumns {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            team_id: row.get(1)?,
            user_id: row.get(2)?,
            entity_type: row.get(3)?,
            original_filename: row.get(4)?,
            status: row.get(5)?,
            headers_json: row.get(6)?,
            row_count: row.get(7)?,
            mappings_json: row.get(8)?,
            results_json: row.get(9)?,
            error_message: row.get(10)?,
            unresolved_links_json: row.get(11)?,
            active_batch_id: row.get(12)?,
            batch_kind: row.get(13)?,
            batch_total: row.get(14)?,
            batch_processed: row.get(15)?,
            batch_active: row.get(16)?,
            heartbeat_at: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
            expires_at: row.get(20)?,
        })
    }

    fn into_session(self) -> RepositoryResult<ImportSession> {
        let status = ImportStatus::parse(&self.status).ok_or_else(|| {
            RepositoryError::InternalError(format!("未知会话状态: {}", self.status))
        })?;

        let batch = match (self.active_batch_id, self.batch_kind.as_deref().and_then(BatchKind::parse)) {
            (Some(batch_id), Some(kind)) => Some(BatchProgress {
                batch_id,
                kind,
                total: self.batch_total.max(0) as u64,
                processed: self.batch_processed.max(0) as u64,
                active: self.batch_active,
                heartbeat_at: match &self.heartbeat_at {
                    Some(ts) => parse_ts(ts)?,
                    None => parse_ts(&self.updated_at)?,
                },
            }),
            _ => None,
        };

        Ok(ImportSession {
            session_id: self.session_id,
            team_id: self.team_id,
            user_id: self.user_id,
            entity_type: self.entity_type,
            original_filename: self.original_filename,
            status,
            headers: from_json("headers", &self.headers_json)?,
            row_count: self.row_count,
            mappings: from_json("mappings", &self.mappings_json)?,
            results: self
                .results_json
                .as_deref()
                .map(|raw| from_json("results", raw))
                .transpose()?,
            error_message: self.error_message,
            batch,
            unresolved_links: from_json("unresolved_links", &self.unresolved_links_json)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            expires_at: parse_ts(&self.expires_at)?,
        })
    }
}

/// import_row 行的原始列值
struct RowColumns {
    row_number: i64,
    raw_json: String,
    corrections_json: String,
    skipped_json: String,
    validation_json: String,
    match_action: Option<String>,
    matched_id: Option<String>,
    relationships_json: String,
}

impl RowColumns {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            row_number: row.get(0)?,
            raw_json: row.get(1)?,
            corrections_json: row.get(2)?,
            skipped_json: row.get(3)?,
            validation_json: row.get(4)?,
            match_action: row.get(5)?,
            matched_id: row.get(6)?,
            relationships_json: row.get(7)?,
        })
    }

    fn into_row(self) -> RepositoryResult<ImportRow> {
        let raw: IndexMap<String, String> = from_json("raw_data", &self.raw_json)?;
        let mut row = ImportRow::new(self.row_number, raw);
        row.corrections = from_json("corrections", &self.corrections_json)?;
        row.skipped = from_json("skipped", &self.skipped_json)?;
        row.validation = from_json("validation", &self.validation_json)?;
        row.match_action = self.match_action.as_deref().and_then(MatchAction::parse);
        row.matched_id = self.matched_id;
        row.relationships = from_json("relationships", &self.relationships_json)?;
        Ok(row)
    }
}

impl ImportStore {
    // ==========================================
    // 会话查询
    // ==========================================

    /// 校验会话存在且未过期，返回当前状态
    pub(super) fn require_live(conn: &Connection, session_id: &str) -> RepositoryResult<ImportStatus> {
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT status, expires_at FROM import_session WHERE session_id = ?1",
                params![session_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match found {
            Some((status, expires_at)) if expires_at.as_str() >= now_ts().as_str() => {
                ImportStatus::parse(&status).ok_or_else(|| {
                    RepositoryError::InternalError(format!("未知会话状态: {}", status))
                })
            }
            _ => Err(RepositoryError::not_found("ImportSession", session_id)),
        }
    }

    /// 查询会话（过期视为不存在）
    pub fn get_session(&self, session_id: &str) -> RepositoryResult<ImportSession> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM import_session WHERE session_id = ?1", SESSION_COLUMNS);
        let columns = conn
            .query_row(&sql, params![session_id], SessionColumns::read)
            .optional()?
            .ok_or_else(|| RepositoryError::not_found("ImportSession", session_id))?;

        let session = columns.into_session()?;
        if session.expires_at < Utc::now() {
            return Err(RepositoryError::not_found("ImportSession", session_id));
        }
        Ok(session)
    }

    pub fn get_mappings(&self, session_id: &str) -> RepositoryResult<ColumnMappings> {
        Ok(self.get_session(session_id)?.mappings)
    }

    // ==========================================
    // 行查询
    // ==========================================

    /// 按行号分页读取
    pub fn rows_page(&self, session_id: &str, offset: usize, limit: usize) -> RepositoryResult<Vec<ImportRow>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_row WHERE session_id = ?1 ORDER BY row_number LIMIT ?2 OFFSET ?3",
            ROW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map(params![session_id, limit as i64, offset as i64], RowColumns::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        columns.into_iter().map(RowColumns::into_row).collect()
    }

    /// 读取指定行号之后的一页（用于分块遍历）
    pub fn rows_after(&self, session_id: &str, after_row: i64, limit: usize) -> RepositoryResult<Vec<ImportRow>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_row WHERE session_id = ?1 AND row_number > ?2 ORDER BY row_number LIMIT ?3",
            ROW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map(params![session_id, after_row, limit as i64], RowColumns::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        columns.into_iter().map(RowColumns::into_row).collect()
    }

    /// 读取行号区间 [from, to]
    pub fn rows_in_range(&self, session_id: &str, from: i64, to: i64) -> RepositoryResult<Vec<ImportRow>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_row WHERE session_id = ?1 AND row_number BETWEEN ?2 AND ?3 ORDER BY row_number",
            ROW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map(params![session_id, from, to], RowColumns::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        columns.into_iter().map(RowColumns::into_row).collect()
    }

    pub fn get_row(&self, session_id: &str, row_number: i64) -> RepositoryResult<ImportRow> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_row WHERE session_id = ?1 AND row_number = ?2",
            ROW_COLUMNS
        );
        let columns = conn
            .query_row(&sql, params![session_id, row_number], RowColumns::read)
            .optional()?
            .ok_or_else(|| RepositoryError::not_found("ImportRow", &format!("{}#{}", session_id, row_number)))?;
        columns.into_row()
    }

    /// 所有行号（升序）
    pub fn row_numbers(&self, session_id: &str) -> RepositoryResult<Vec<i64>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT row_number FROM import_row WHERE session_id = ?1 ORDER BY row_number")?;
        let numbers = stmt
            .query_map(params![session_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(numbers)
    }

    /// 某列的全部单元格（按行号），总是反映最新修正与跳过
    pub fn column_cells(&self, session_id: &str, source: &str) -> RepositoryResult<Vec<ColumnCell>> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT row_number, raw_json, corrections_json, skipped_json, validation_json
            FROM import_row WHERE session_id = ?1 ORDER BY row_number
            "#,
        )?;
        let raw_rows = stmt
            .query_map(params![session_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cells = Vec::with_capacity(raw_rows.len());
        for (row_number, raw_json, corrections_json, skipped_json, validation_json) in raw_rows {
            let raw: IndexMap<String, String> = from_json("raw_data", &raw_json)?;
            let mut corrections: BTreeMap<String, String> = from_json("corrections", &corrections_json)?;
            let skipped: BTreeMap<String, bool> = from_json("skipped", &skipped_json)?;
            let mut validation: BTreeMap<String, CellIssue> = from_json("validation", &validation_json)?;
            cells.push(ColumnCell {
                row_number,
                raw: raw.get(source).cloned().unwrap_or_default(),
                correction: corrections.remove(source),
                skipped: skipped.get(source).copied().unwrap_or(false),
                issue: validation.remove(source),
            });
        }
        Ok(cells)
    }

    /// 行匹配结论计数
    pub fn action_counts(&self, session_id: &str) -> RepositoryResult<ActionCounts> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT match_action, COUNT(*) FROM import_row WHERE session_id = ?1 GROUP BY match_action",
        )?;
        let groups = stmt
            .query_map(params![session_id], |r| {
                Ok((r.get::<_, Option<String>>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = ActionCounts::default();
        for (action, n) in groups {
            let n = n.max(0) as u64;
            match action.as_deref().and_then(MatchAction::parse) {
                Some(MatchAction::Create) => counts.create += n,
                Some(MatchAction::Update) => counts.update += n,
                Some(MatchAction::Skip) => counts.skip += n,
                None => counts.unresolved += n,
            }
        }
        Ok(counts)
    }

    /// 执行失败行（按行号升序）
    pub fn failed_rows(&self, session_id: &str) -> RepositoryResult<Vec<FailedRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT row_number, error FROM import_failed_row WHERE session_id = ?1 ORDER BY row_number",
        )?;
        let rows = stmt
            .query_map(params![session_id], |r| {
                Ok(FailedRow {
                    row_number: r.get(0)?,
                    error: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
