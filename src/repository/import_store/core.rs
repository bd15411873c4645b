use crate::domain::import::{ImportResults, ImportRow, ImportSession, NewSession};
use crate::domain::mapping::ColumnMappings;
use crate::domain::types::{BatchKind, ImportStatus};
use crate::repository::error::{from_json, to_json, RepositoryError, RepositoryResult};
use crate::repository::{format_ts, now_ts};
use chrono::{Duration, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// 会话默认存活时长（小时）
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

// ==========================================
// ImportStore - 会话工作集仓储
// ==========================================
// 红线: Repository 不做业务逻辑，只做数据映射与条件更新
pub struct ImportStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl ImportStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self::with_ttl(conn, DEFAULT_SESSION_TTL_HOURS)
    }

    /// # 参数
    /// - ttl_hours: 会话存活时长，每次心跳写入时顺延
    pub fn with_ttl(conn: Arc<Mutex<Connection>>, ttl_hours: i64) -> Self {
        Self {
            conn,
            ttl: Duration::hours(ttl_hours.max(1)),
        }
    }

    /// 获取数据库连接
    pub(super) fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub(super) fn next_expiry(&self) -> String {
        format_ts(Utc::now() + self.ttl)
    }

    // ==========================================
    // 会话生命周期
    // ==========================================

    /// 创建会话（状态 Mapping）
    pub fn create_session(&self, new: &NewSession) -> RepositoryResult<ImportSession> {
        let session_id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.get_conn()?;
            let now = now_ts();
            conn.execute(
                r#"
                INSERT INTO import_session (
                    session_id, team_id, user_id, entity_type, original_filename,
                    status, created_at, updated_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)
                "#,
                params![
                    session_id,
                    new.team_id,
                    new.user_id,
                    new.entity_type,
                    new.original_filename,
                    ImportStatus::Mapping.as_str(),
                    now,
                    self.next_expiry(),
                ],
            )?;
        }
        info!(session_id = %session_id, team_id = %new.team_id, entity_type = %new.entity_type, "导入会话已创建");
        self.get_session(&session_id)
    }

    /// 删除会话及其全部行（取消）
    ///
    /// # 返回
    /// - true: 已删除；false: 会话不存在
    pub fn delete_session(&self, session_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "DELETE FROM import_session WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(affected > 0)
    }

    /// 清理过期会话
    pub fn purge_expired(&self) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "DELETE FROM import_session WHERE expires_at < ?1",
            params![now_ts()],
        )?;
        if affected > 0 {
            info!(purged = affected, "已清理过期导入会话");
        }
        Ok(affected)
    }

    /// 顺延会话有效期
    pub fn touch(&self, session_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        conn.execute(
            "UPDATE import_session SET expires_at = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, self.next_expiry(), now_ts()],
        )?;
        Ok(())
    }

    // ==========================================
    // 表头与行
    // ==========================================

    pub fn set_headers(&self, session_id: &str, headers: &[String]) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        conn.execute(
            "UPDATE import_session SET headers_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, to_json("headers", headers)?, now_ts()],
        )?;
        Ok(())
    }

    /// 批量追加原始行（同一事务）
    ///
    /// # 返回
    /// - 本次写入行数；行号重复时整批回滚
    pub fn append_rows(
        &self,
        session_id: &str,
        rows: &[(i64, IndexMap<String, String>)],
    ) -> RepositoryResult<usize> {
        let mut conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        let tx = conn.transaction()?;

        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO import_row (session_id, row_number, raw_json) VALUES (?1, ?2, ?3)",
            )?;
            for (row_number, raw) in rows {
                stmt.execute(params![session_id, row_number, to_json("raw_data", raw)?])?;
                count += 1;
            }
        }
        tx.execute(
            r#"
            UPDATE import_session
            SET row_count = (SELECT COUNT(*) FROM import_row WHERE session_id = ?1),
                updated_at = ?2
            WHERE session_id = ?1
            "#,
            params![session_id, now_ts()],
        )?;
        tx.commit()?;

        debug!(session_id, appended = count, "原始行已写入");
        Ok(count)
    }

    /// 显式设置总行数（流式上传时由调用方给出）
    pub fn set_row_count(&self, session_id: &str, row_count: i64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        conn.execute(
            "UPDATE import_session SET row_count = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, row_count, now_ts()],
        )?;
        Ok(())
    }

    // ==========================================
    // 映射与状态
    // ==========================================

    /// 整体替换映射（同一事务）
    ///
    /// # 规则
    /// - 清空关联未解析计数
    /// - 清空全部行的匹配结论与关联结果，旧映射下的解析不得沿用
    pub fn set_mappings(&self, session_id: &str, mappings: &ColumnMappings) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            UPDATE import_session
            SET mappings_json = ?2, unresolved_links_json = '{}', updated_at = ?3
            WHERE session_id = ?1
            "#,
            params![session_id, to_json("mappings", mappings)?, now_ts()],
        )?;
        let reset = tx.execute(
            r#"
            UPDATE import_row
            SET match_action = NULL, matched_id = NULL, relationships_json = '[]'
            WHERE session_id = ?1
            "#,
            params![session_id],
        )?;
        tx.commit()?;
        debug!(session_id, reset, "映射已替换，行解析结果已清空");
        Ok(())
    }

    /// 只改写某列的格式设置（映射目标不变，解析结果保留）
    pub fn update_column(&self, session_id: &str, mappings: &ColumnMappings) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        conn.execute(
            "UPDATE import_session SET mappings_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, to_json("mappings", mappings)?, now_ts()],
        )?;
        Ok(())
    }

    /// 状态前进
    ///
    /// # 返回
    /// - Err(InvalidStateTransition): 非法流转（含终态之后的任何写入）
    pub fn set_status(&self, session_id: &str, next: ImportStatus) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let current = Self::require_live(&conn, session_id)?;
        if !current.can_advance_to(next) {
            return Err(RepositoryError::InvalidStateTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        Self::write_status(&conn, session_id, next)?;
        info!(session_id, from = %current, to = %next, "会话状态变更");
        Ok(())
    }

    /// 用户"返回上一步"
    pub fn go_back(&self, session_id: &str, target: ImportStatus) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let current = Self::require_live(&conn, session_id)?;
        if !current.can_go_back_to(target) {
            return Err(RepositoryError::InvalidStateTransition {
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        Self::write_status(&conn, session_id, target)
    }

    fn write_status(conn: &Connection, session_id: &str, status: ImportStatus) -> RepositoryResult<()> {
        conn.execute(
            "UPDATE import_session SET status = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    // ==========================================
    // 行级写入
    // ==========================================

    /// 写回后台任务产出的行状态（校验、匹配结论、关联结果）
    ///
    /// # 说明
    /// - 修正与跳过归审核操作所有，此处不写，批次运行期间的审核编辑不会被覆盖
    pub fn update_rows(&self, session_id: &str, rows: &[ImportRow]) -> RepositoryResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE import_row
                SET validation_json = ?3, match_action = ?4, matched_id = ?5, relationships_json = ?6
                WHERE session_id = ?1 AND row_number = ?2
                "#,
            )?;
            for row in rows {
                count += stmt.execute(params![
                    session_id,
                    row.row_number,
                    to_json("validation", &row.validation)?,
                    row.match_action.map(|a| a.as_str()),
                    row.matched_id,
                    to_json("relationships", &row.relationships)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// 对某列等于 raw_value 的所有行写入修正
    ///
    /// # 规则
    /// - new_value 去空白后等于 raw_value 去空白 → 视为撤销修正
    ///
    /// # 返回
    /// - 受影响行数
    pub fn apply_correction(
        &self,
        session_id: &str,
        source: &str,
        raw_value: &str,
        new_value: &str,
    ) -> RepositoryResult<usize> {
        let restore = new_value.trim() == raw_value.trim();
        self.rewrite_matching(session_id, source, raw_value, |row| {
            let changed = if restore {
                row.corrections.remove(source).is_some()
            } else {
                row.corrections.insert(source.to_string(), new_value.to_string())
                    != Some(new_value.to_string())
            };
            if changed {
                row.validation.remove(source);
            }
            changed
        })
    }

    /// 设置/取消某列某原始值的跳过标记（与修正相互独立）
    pub fn set_skip(
        &self,
        session_id: &str,
        source: &str,
        raw_value: &str,
        skipped: bool,
    ) -> RepositoryResult<usize> {
        self.rewrite_matching(session_id, source, raw_value, |row| {
            if skipped {
                row.skipped.insert(source.to_string(), true) != Some(true)
            } else {
                row.skipped.remove(source).is_some()
            }
        })
    }

    /// 为某列写入（或清除）校验问题
    pub fn set_cell_issue(
        &self,
        session_id: &str,
        source: &str,
        raw_value: &str,
        issue: Option<crate::domain::import::CellIssue>,
    ) -> RepositoryResult<usize> {
        self.rewrite_matching(session_id, source, raw_value, |row| match &issue {
            Some(issue) => row.validation.insert(source.to_string(), issue.clone()).as_ref() != Some(issue),
            None => row.validation.remove(source).is_some(),
        })
    }

    /// 读取-修改-写回 某列原始值等于 raw_value 的行（单事务）
    fn rewrite_matching<F>(
        &self,
        session_id: &str,
        source: &str,
        raw_value: &str,
        mut edit: F,
    ) -> RepositoryResult<usize>
    where
        F: FnMut(&mut EditableCells) -> bool,
    {
        let mut conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;
        let tx = conn.transaction()?;

        let candidates: Vec<(i64, String, String, String, String)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT row_number, raw_json, corrections_json, skipped_json, validation_json
                FROM import_row WHERE session_id = ?1
                "#,
            )?;
            let rows = stmt.query_map(params![session_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut changed = 0;
        for (row_number, raw_json, corrections_json, skipped_json, validation_json) in candidates {
            let raw: IndexMap<String, String> = from_json("raw_data", &raw_json)?;
            if raw.get(source).map(|v| v.trim()) != Some(raw_value.trim()) {
                continue;
            }
            let mut cells = EditableCells {
                corrections: from_json("corrections", &corrections_json)?,
                skipped: from_json("skipped", &skipped_json)?,
                validation: from_json("validation", &validation_json)?,
            };
            if !edit(&mut cells) {
                continue;
            }
            tx.execute(
                r#"
                UPDATE import_row
                SET corrections_json = ?3, skipped_json = ?4, validation_json = ?5
                WHERE session_id = ?1 AND row_number = ?2
                "#,
                params![
                    session_id,
                    row_number,
                    to_json("corrections", &cells.corrections)?,
                    to_json("skipped", &cells.skipped)?,
                    to_json("validation", &cells.validation)?,
                ],
            )?;
            changed += 1;
        }
        tx.execute(
            "UPDATE import_session SET updated_at = ?2 WHERE session_id = ?1",
            params![session_id, now_ts()],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// 清空所有行的匹配结论（主匹配列被修改后需重新解析）
    pub fn reset_match_actions(&self, session_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE import_row SET match_action = NULL, matched_id = NULL WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(affected)
    }

    // ==========================================
    // 后台批次（心跳）
    // ==========================================

    /// 开启批次
    ///
    /// # 规则
    /// - 同一会话至多一个活动批次；心跳超过 stale_after 未更新的批次视为已死，可被接管
    ///
    /// # 返回
    /// - Ok(batch_id)
    /// - Err(BatchInProgress): 已有活动批次
    pub fn begin_batch(
        &self,
        session_id: &str,
        kind: BatchKind,
        total: u64,
        stale_after: Duration,
    ) -> RepositoryResult<String> {
        let conn = self.get_conn()?;
        Self::require_live(&conn, session_id)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let affected = conn.execute(
            r#"
            UPDATE import_session
            SET active_batch_id = ?2, batch_kind = ?3, batch_total = ?4, batch_processed = 0,
                batch_active = 1, heartbeat_at = ?5, expires_at = ?6, updated_at = ?5
            WHERE session_id = ?1
              AND (batch_active = 0 OR heartbeat_at IS NULL OR heartbeat_at < ?7)
            "#,
            params![
                session_id,
                batch_id,
                kind.as_str(),
                total as i64,
                format_ts(now),
                self.next_expiry(),
                format_ts(now - stale_after),
            ],
        )?;

        if affected == 0 {
            let active: Option<String> = conn
                .query_row(
                    "SELECT active_batch_id FROM import_session WHERE session_id = ?1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            return Err(RepositoryError::BatchInProgress {
                session_id: session_id.to_string(),
                batch_id: active.unwrap_or_default(),
            });
        }

        debug!(session_id, batch_id = %batch_id, kind = %kind, total, "批次已开启");
        Ok(batch_id)
    }

    /// 心跳: 累加已处理数并顺延会话有效期
    ///
    /// # 返回
    /// - false: 批次已被取消或替换，调用方应停止
    pub fn heartbeat(&self, session_id: &str, batch_id: &str, processed: u64) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let now = now_ts();
        let affected = conn.execute(
            r#"
            UPDATE import_session
            SET batch_processed = batch_processed + ?3, heartbeat_at = ?4,
                expires_at = ?5, updated_at = ?4
            WHERE session_id = ?1 AND active_batch_id = ?2 AND batch_active = 1
            "#,
            params![session_id, batch_id, processed as i64, now, self.next_expiry()],
        )?;
        Ok(affected > 0)
    }

    /// 结束批次
    pub fn finish_batch(&self, session_id: &str, batch_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            UPDATE import_session
            SET batch_active = 0, heartbeat_at = ?3, updated_at = ?3
            WHERE session_id = ?1 AND active_batch_id = ?2
            "#,
            params![session_id, batch_id, now_ts()],
        )?;
        debug!(session_id, batch_id, "批次已结束");
        Ok(())
    }

    // ==========================================
    // 执行结果
    // ==========================================

    pub fn set_results(&self, session_id: &str, results: &ImportResults) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_session SET results_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, to_json("results", results)?, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_error(&self, session_id: &str, message: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_session SET error_message = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, message, now_ts()],
        )?;
        Ok(())
    }

    /// 记录执行失败行（同一行重复失败时覆盖）
    pub fn add_failed_row(&self, session_id: &str, row_number: i64, error: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO import_failed_row (session_id, row_number, error) VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id, row_number) DO UPDATE SET error = ?3
            "#,
            params![session_id, row_number, error],
        )?;
        Ok(())
    }

    /// 写入某关联的未解析行数（读-改-写 JSON 列）
    pub fn set_unresolved(&self, session_id: &str, link: &str, count: u64) -> RepositoryResult<()> {
        self.edit_unresolved(session_id, |map| {
            map.insert(link.to_string(), count);
        })
    }

    /// 清除某关联的解析记录（其列被修正后需重新解析）
    pub fn clear_unresolved(&self, session_id: &str, link: &str) -> RepositoryResult<()> {
        self.edit_unresolved(session_id, |map| {
            map.remove(link);
        })
    }

    fn edit_unresolved<F>(&self, session_id: &str, edit: F) -> RepositoryResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, u64>),
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let raw: String = tx.query_row(
            "SELECT unresolved_links_json FROM import_session WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        let mut map: BTreeMap<String, u64> = from_json("unresolved_links", &raw)?;
        edit(&mut map);
        tx.execute(
            "UPDATE import_session SET unresolved_links_json = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id, to_json("unresolved_links", &map)?, now_ts()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// 行内可编辑的稀疏单元格状态
pub(super) struct EditableCells {
    pub corrections: BTreeMap<String, String>,
    pub skipped: BTreeMap<String, bool>,
    pub validation: BTreeMap<String, crate::domain::import::CellIssue>,
}
