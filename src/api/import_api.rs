// ==========================================
// CRM 导入引擎 - 导入 API
// ==========================================
// 职责: 对外暴露导入会话的全部操作（建会话 / 映射 / 审核 / 解析 / 提交 / 轮询）
// 并发: 后台批次按分块 spawn_blocking，join_all 汇合；执行批次在独立 task 中顺序处理
// 红线: 同一会话至多一个活动批次（由 ImportStore.begin_batch 保证）
// ==========================================

use crate::api::error::{config_or_default, ApiError, ApiResult};
use crate::config::{ConfigManager, ImportConfig, ImportConfigReader};
use crate::domain::analysis::{AnalysisPage, AnalysisQuery};
use crate::domain::import::{FailedRow, ImportResults, ImportRow, ImportSession, NewSession};
use crate::domain::mapping::{ColumnData, ColumnMappings};
use crate::domain::types::{BatchKind, ImportStatus};
use crate::engine::{
    chunk_ranges, validation_field, validator_for, BatchReporter, ColumnAnalyzer,
    ExecuteImportJob, ImportNotification, ImportOutcome, JobContext, JobError, JobResult,
    Notifier, ResolveMatchesJob, ValidateColumnJob,
};
use crate::importer::{
    AutoMapper, DataTypeInferencer, DateFormat, NumberFormat, ParsedSheet, UniversalFileParser,
};
use crate::repository::{ImportStore, SqliteRecordRepository};
use crate::schema::SchemaRegistry;
use futures::future::join_all;
use indexmap::IndexMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// 心跳超过该时长未更新的批次视为已死，可被新批次接管
const BATCH_STALE_AFTER_SECS: i64 = 300;

// ==========================================
// 响应类型
// ==========================================

/// 提交前预览
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPreview {
    pub create_count: u64,
    pub update_count: u64,
    pub skip_count: u64,
    /// 尚未解析匹配结论的行（提交时会先补齐）
    pub unresolved_count: u64,
    pub sample_rows: Vec<ImportRow>,
}

/// 会话状态轮询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub status: ImportStatus,
    /// 当前批次已处理行数
    pub processed: u64,
    /// 当前批次总行数
    pub total: u64,
    pub batch_active: bool,
    pub results: Option<ImportResults>,
    pub error: Option<String>,
    pub unresolved_links: BTreeMap<String, u64>,
}

impl StatusReport {
    fn from_session(session: ImportSession) -> Self {
        let (processed, total, batch_active) = match &session.batch {
            Some(batch) => (batch.processed, batch.total, batch.active),
            None => (0, 0, false),
        };
        Self {
            session_id: session.session_id,
            status: session.status,
            processed,
            total,
            batch_active,
            results: session.results,
            error: session.error_message,
            unresolved_links: session.unresolved_links,
        }
    }
}

type CancelFlags = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

/// 导入 API
pub struct ImportApi {
    ctx: JobContext,
    config: ImportConfig,
    notifier: Arc<dyn Notifier>,
    cancel_flags: CancelFlags,
    executions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ImportApi {
    /// 由已装配的依赖创建
    pub fn new(ctx: JobContext, config: ImportConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ctx,
            config,
            notifier,
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// 从共享连接装配（读取 config_kv 配置，缺失时用默认值）
    pub async fn from_connection(
        conn: Arc<Mutex<Connection>>,
        notifier: Arc<dyn Notifier>,
    ) -> ApiResult<Self> {
        let manager = ConfigManager::from_connection(conn.clone())
            .map_err(|e| ApiError::ConfigError(e.to_string()))?;
        let config = config_or_default(manager.load_import_config().await);

        let ctx = JobContext::new(
            Arc::new(ImportStore::with_ttl(conn.clone(), config.session_ttl_hours)),
            Arc::new(SqliteRecordRepository::new(conn.clone())),
            Arc::new(SchemaRegistry::new(conn)),
        );
        info!(chunk_size = config.row_chunk_size, ttl_hours = config.session_ttl_hours, "导入 API 已就绪");
        Ok(Self::new(ctx, config, notifier))
    }

    /// 打开（必要时初始化）数据库文件并装配
    pub async fn open(db_path: &str, notifier: Arc<dyn Notifier>) -> ApiResult<Self> {
        let conn = crate::db::open_and_init(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
        Self::from_connection(Arc::new(Mutex::new(conn)), notifier).await
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// 在阻塞线程池上执行同步仓储操作
    async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(JobContext) -> ApiResult<T> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || f(ctx)).await?
    }

    // ==========================================
    // 会话与原始数据
    // ==========================================

    /// 创建导入会话
    ///
    /// # 返回
    /// - Ok(session_id)
    /// - Err(InvalidInput): 实体类型不存在
    pub async fn create_session(
        &self,
        team_id: &str,
        user_id: &str,
        entity_type: &str,
        original_filename: &str,
    ) -> ApiResult<String> {
        if team_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("team_id 不能为空".to_string()));
        }
        let new = NewSession {
            team_id: team_id.to_string(),
            user_id: user_id.to_string(),
            entity_type: entity_type.to_string(),
            original_filename: original_filename.to_string(),
        };
        self.blocking(move |ctx| {
            ctx.schemas.entity_schema(&new.team_id, &new.entity_type)?;
            let session = ctx.store.create_session(&new)?;
            info!(session_id = %session.session_id, entity_type = %new.entity_type, "导入会话已创建");
            Ok(session.session_id)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> ApiResult<ImportSession> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.get_session(&session_id)?)).await
    }

    pub async fn set_headers(&self, session_id: &str, headers: Vec<String>) -> ApiResult<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.set_headers(&session_id, &headers)?)).await
    }

    /// 读取会话表头
    pub async fn load_headers(&self, session_id: &str) -> ApiResult<Vec<String>> {
        Ok(self.get_session(session_id).await?.headers)
    }

    /// 追加原始行
    ///
    /// # 返回
    /// - 本次写入行数
    pub async fn append_rows(
        &self,
        session_id: &str,
        rows: Vec<(i64, IndexMap<String, String>)>,
    ) -> ApiResult<usize> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.append_rows(&session_id, &rows)?)).await
    }

    pub async fn set_row_count(&self, session_id: &str, row_count: i64) -> ApiResult<()> {
        if row_count < 0 {
            return Err(ApiError::InvalidInput(format!("row_count 不能为负: {}", row_count)));
        }
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.set_row_count(&session_id, row_count)?)).await
    }

    /// 写入已解析的表格（表头 + 全部行 + 行数）
    pub async fn load_sheet(&self, session_id: &str, sheet: ParsedSheet) -> ApiResult<usize> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| {
            ctx.store.set_headers(&session_id, &sheet.headers)?;
            let appended = ctx.store.append_rows(&session_id, &sheet.keyed_rows())?;
            ctx.store.set_row_count(&session_id, sheet.row_count() as i64)?;
            Ok(appended)
        })
        .await
    }

    /// 解析文件 → 写入会话 → 自动映射
    ///
    /// # 返回
    /// - 自动生成的映射
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn load_file<P: AsRef<Path>>(&self, session_id: &str, path: P) -> ApiResult<ColumnMappings> {
        let path = path.as_ref().to_path_buf();
        let sheet = tokio::task::spawn_blocking(move || UniversalFileParser.parse(&path)).await??;
        info!(headers = sheet.headers.len(), rows = sheet.row_count(), "文件解析完成");

        self.load_sheet(session_id, sheet.clone()).await?;
        self.auto_map(session_id, &sheet).await
    }

    /// 按表头别名与值样本生成初始映射并写入会话
    pub async fn auto_map(&self, session_id: &str, sheet: &ParsedSheet) -> ApiResult<ColumnMappings> {
        let session_id = session_id.to_string();
        let sheet = sheet.clone();
        let mapper = AutoMapper::new(
            DataTypeInferencer::new(
                self.config.inference_min_samples,
                self.config.inference_confidence_threshold,
            ),
            self.config.preview_sample_size.max(crate::importer::auto_mapper::DEFAULT_SAMPLE_SIZE),
        );
        self.blocking(move |ctx| {
            let session = ctx.store.get_session(&session_id)?;
            let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
            let mappings = mapper.map(&schema, &sheet);
            ctx.store.set_mappings(&session_id, &mappings)?;
            info!(session_id = %session_id, mapped = mappings.len(), "自动映射完成");
            Ok(mappings)
        })
        .await
    }

    // ==========================================
    // 映射
    // ==========================================

    /// 整体替换映射（仅 MAPPING 阶段）
    pub async fn set_mappings(&self, session_id: &str, columns: Vec<ColumnData>) -> ApiResult<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| {
            let session = ctx.store.get_session(&session_id)?;
            if session.status != ImportStatus::Mapping {
                return Err(ApiError::BusinessRuleViolation(format!(
                    "映射只能在 MAPPING 阶段修改，当前状态: {}",
                    session.status
                )));
            }
            let unknown: Vec<String> = columns
                .iter()
                .filter(|c| !session.headers.is_empty() && !session.headers.contains(&c.source))
                .map(|c| c.source.clone())
                .collect();
            if !unknown.is_empty() {
                return Err(ApiError::InvalidInput(format!("未知表头: {}", unknown.join(", "))));
            }
            ctx.store.set_mappings(&session_id, &ColumnMappings::new(columns))?;
            Ok(())
        })
        .await
    }

    pub async fn get_mappings(&self, session_id: &str) -> ApiResult<Vec<ColumnData>> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.get_mappings(&session_id)?.into_vec())).await
    }

    /// 校验映射并进入审核阶段
    ///
    /// # 返回
    /// - Err(InvalidMapping): 映射问题列表
    pub async fn begin_review(&self, session_id: &str) -> ApiResult<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| {
            let session = ctx.store.get_session(&session_id)?;
            let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
            let issues = schema.validate_mappings(&session.mappings);
            if !issues.is_empty() {
                return Err(ApiError::InvalidMapping(issues));
            }
            ctx.store.set_status(&session_id, ImportStatus::Reviewing)?;
            Ok(())
        })
        .await
    }

    /// 返回上一步（仅 REVIEWING → MAPPING）
    pub async fn go_back(&self, session_id: &str, target: ImportStatus) -> ApiResult<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| Ok(ctx.store.go_back(&session_id, target)?)).await
    }

    // ==========================================
    // 审核: 列分析与修正
    // ==========================================

    /// 列唯一值分页
    ///
    /// # 参数
    /// - query: None 时取第一页，每页条数取配置
    pub async fn analyze_column(
        &self,
        session_id: &str,
        source: &str,
        query: Option<AnalysisQuery>,
    ) -> ApiResult<AnalysisPage> {
        let session_id = session_id.to_string();
        let source = source.to_string();
        let query = query.unwrap_or_else(|| AnalysisQuery::first_page(self.config.analysis_page_size));
        self.blocking(move |ctx| {
            let session = ctx.store.get_session(&session_id)?;
            if session.mappings.get(&source).is_none() {
                return Err(ApiError::InvalidInput(format!("列未映射: {}", source)));
            }
            let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
            let page = ColumnAnalyzer::new(&ctx.store, &schema).page(&session, &source, &query)?;
            Ok(page)
        })
        .await
    }

    /// 修正某列某原始值（new_value 等于原值即撤销）
    ///
    /// # 返回
    /// - 受影响行数
    pub async fn apply_correction(
        &self,
        session_id: &str,
        source: &str,
        raw_value: &str,
        new_value: &str,
    ) -> ApiResult<usize> {
        let (session_id, source) = (session_id.to_string(), source.to_string());
        let (raw_value, new_value) = (raw_value.to_string(), new_value.to_string());
        self.blocking(move |ctx| {
            let session = require_reviewable(&ctx, &session_id)?;
            let affected = ctx
                .store
                .apply_correction(&session_id, &source, &raw_value, &new_value)?;
            if affected > 0 {
                revalidate_value(&ctx, &session, &source, &raw_value, &new_value)?;
                invalidate_dependents(&ctx, &session, &source)?;
            }
            Ok(affected)
        })
        .await
    }

    pub async fn skip_value(&self, session_id: &str, source: &str, raw_value: &str) -> ApiResult<usize> {
        self.set_skip(session_id, source, raw_value, true).await
    }

    pub async fn unskip_value(&self, session_id: &str, source: &str, raw_value: &str) -> ApiResult<usize> {
        self.set_skip(session_id, source, raw_value, false).await
    }

    async fn set_skip(&self, session_id: &str, source: &str, raw_value: &str, skipped: bool) -> ApiResult<usize> {
        let (session_id, source, raw_value) =
            (session_id.to_string(), source.to_string(), raw_value.to_string());
        self.blocking(move |ctx| {
            let session = require_reviewable(&ctx, &session_id)?;
            let affected = ctx.store.set_skip(&session_id, &source, &raw_value, skipped)?;
            if affected > 0 {
                invalidate_dependents(&ctx, &session, &source)?;
            }
            Ok(affected)
        })
        .await
    }

    /// 设置列的日期/数值格式并重新校验该列
    pub async fn set_column_format(
        &self,
        session_id: &str,
        source: &str,
        date_format: Option<DateFormat>,
        number_format: Option<NumberFormat>,
    ) -> ApiResult<()> {
        {
            let (session_id, source) = (session_id.to_string(), source.to_string());
            self.blocking(move |ctx| {
                let session = require_reviewable(&ctx, &session_id)?;
                let column = session
                    .mappings
                    .get(&source)
                    .ok_or_else(|| ApiError::InvalidInput(format!("列未映射: {}", source)))?
                    .with_date_format(date_format)
                    .with_number_format(number_format);
                ctx.store.update_column(&session_id, &session.mappings.replace(column))?;
                Ok(())
            })
            .await?;
        }
        self.resolve_entity_links(session_id, source).await?;
        Ok(())
    }

    // ==========================================
    // 后台批次: 匹配与关联解析
    // ==========================================

    /// 为全部行计算匹配结论（Create / Update / Skip）
    ///
    /// # 返回
    /// - 已处理行数
    #[instrument(skip(self))]
    pub async fn resolve_matches(&self, session_id: &str) -> ApiResult<u64> {
        let job = Arc::new(ResolveMatchesJob::new(self.ctx.clone()));
        let processed = self
            .run_batch(session_id, BatchKind::ResolveMatches, move |reporter, from, to| {
                job.run_chunk(reporter, from, to)
            })
            .await?;
        let total: u64 = processed.into_iter().sum();
        info!(session_id, total, "行匹配完成");
        Ok(total)
    }

    /// 校验某列并解析其关联（关联列时）
    ///
    /// # 返回
    /// - 未解析的非空值行数（字段列恒为 0）
    #[instrument(skip(self))]
    pub async fn resolve_entity_links(&self, session_id: &str, source: &str) -> ApiResult<u64> {
        let (sid, src) = (session_id.to_string(), source.to_string());
        let (link, detected) = self
            .blocking(move |ctx| {
                let session = ctx.store.get_session(&sid)?;
                let column = session
                    .mappings
                    .get(&src)
                    .cloned()
                    .ok_or_else(|| ApiError::InvalidInput(format!("列未映射: {}", src)))?;
                let detected = detect_column_date_format(&ctx, &session, &column)?;
                Ok((column.relationship, detected))
            })
            .await?;

        let job = Arc::new(ValidateColumnJob::new(self.ctx.clone(), source, detected));
        let reports = self
            .run_batch(session_id, BatchKind::ValidateColumn, move |reporter, from, to| {
                job.run_chunk(reporter, from, to)
            })
            .await?;
        let unresolved: u64 = reports.iter().map(|r| r.unresolved).sum();

        if let Some(link) = link {
            let session_id = session_id.to_string();
            self.blocking(move |ctx| Ok(ctx.store.set_unresolved(&session_id, &link, unresolved)?))
                .await?;
        }
        info!(session_id, source, unresolved, "列校验完成");
        Ok(unresolved)
    }

    /// 开启批次，按分块并行执行，等待全部完成
    async fn run_batch<R, F>(&self, session_id: &str, kind: BatchKind, chunk: F) -> ApiResult<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(&BatchReporter, i64, i64) -> JobResult<R> + Send + Sync + 'static,
    {
        let sid = session_id.to_string();
        let chunk_size = self.config.row_chunk_size;
        let (batch_id, ranges) = self
            .blocking(move |ctx| {
                ctx.store.get_session(&sid)?;
                let row_numbers = ctx.store.row_numbers(&sid)?;
                let batch_id = ctx.store.begin_batch(
                    &sid,
                    kind,
                    row_numbers.len() as u64,
                    chrono::Duration::seconds(BATCH_STALE_AFTER_SECS),
                )?;
                Ok((batch_id, chunk_ranges(&row_numbers, chunk_size)))
            })
            .await?;

        let cancel = self.register_cancel_flag(session_id)?;
        let reporter = BatchReporter::new(self.ctx.store.clone(), session_id, &batch_id, cancel);
        info!(session_id, batch_id = %batch_id, kind = %kind, chunks = ranges.len(), "批次开始");

        let chunk = Arc::new(chunk);
        let handles = ranges.into_iter().map(|(from, to)| {
            let chunk = chunk.clone();
            let reporter = reporter.clone();
            tokio::task::spawn_blocking(move || chunk(&reporter, from, to))
        });
        let joined = join_all(handles).await;

        if let Err(e) = reporter.finish() {
            warn!(session_id, batch_id = %batch_id, error = %e, "批次结束标记写入失败");
        }
        self.release_cancel_flag(session_id);

        let mut outputs = Vec::with_capacity(joined.len());
        for result in joined {
            outputs.push(result??);
        }
        Ok(outputs)
    }

    fn register_cancel_flag(&self, session_id: &str) -> ApiResult<Arc<AtomicBool>> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .map_err(|e| ApiError::InternalError(format!("取消标记锁获取失败: {}", e)))?
            .insert(session_id.to_string(), flag.clone());
        Ok(flag)
    }

    fn release_cancel_flag(&self, session_id: &str) {
        release_flag(&self.cancel_flags, session_id);
    }

    // ==========================================
    // 提交
    // ==========================================

    /// 提交前预览
    pub async fn preview(&self, session_id: &str) -> ApiResult<ImportPreview> {
        let session_id = session_id.to_string();
        let sample = self.config.preview_sample_size;
        self.blocking(move |ctx| {
            ctx.store.get_session(&session_id)?;
            let counts = ctx.store.action_counts(&session_id)?;
            let sample_rows = ctx.store.rows_page(&session_id, 0, sample)?;
            Ok(ImportPreview {
                create_count: counts.create,
                update_count: counts.update,
                skip_count: counts.skip,
                unresolved_count: counts.unresolved,
                sample_rows,
            })
        })
        .await
    }

    /// 启动执行批次（后台运行，调用方轮询 poll_status）
    ///
    /// # 说明
    /// - 尚无匹配结论的行先补齐解析
    /// - 已映射但尚未解析的关联先解析
    ///
    /// # 返回
    /// - Ok(batch_id)
    #[instrument(skip(self))]
    pub async fn start_execution(&self, session_id: &str) -> ApiResult<String> {
        let session = self.get_session(session_id).await?;
        match session.status {
            ImportStatus::Mapping | ImportStatus::Reviewing => {}
            other => {
                return Err(ApiError::InvalidStateTransition {
                    from: other.to_string(),
                    to: ImportStatus::Importing.to_string(),
                })
            }
        }
        if session.status == ImportStatus::Mapping {
            let sid = session_id.to_string();
            self.blocking(move |ctx| {
                let session = ctx.store.get_session(&sid)?;
                let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
                let issues = schema.validate_mappings(&session.mappings);
                if !issues.is_empty() {
                    return Err(ApiError::InvalidMapping(issues));
                }
                Ok(())
            })
            .await?;
        }

        if self.preview(session_id).await?.unresolved_count > 0 {
            self.resolve_matches(session_id).await?;
        }
        for link in session.mappings.mapped_links() {
            if session.unresolved_links.contains_key(&link) {
                continue;
            }
            if let Some(column) = session.mappings.columns_for_link(&link).first() {
                self.resolve_entity_links(session_id, &column.source).await?;
            }
        }

        let sid = session_id.to_string();
        let batch_id = self
            .blocking(move |ctx| {
                let total = ctx.store.row_numbers(&sid)?.len() as u64;
                let batch_id = ctx.store.begin_batch(
                    &sid,
                    BatchKind::Execute,
                    total,
                    chrono::Duration::seconds(BATCH_STALE_AFTER_SECS),
                )?;
                if let Err(e) = ctx.store.set_status(&sid, ImportStatus::Importing) {
                    ctx.store.finish_batch(&sid, &batch_id)?;
                    return Err(e.into());
                }
                Ok(batch_id)
            })
            .await?;

        let cancel = self.register_cancel_flag(session_id)?;
        let reporter = BatchReporter::new(self.ctx.store.clone(), session_id, &batch_id, cancel);
        let task = ExecutionTask {
            ctx: self.ctx.clone(),
            session,
            chunk_size: self.config.row_chunk_size,
            notifier: self.notifier.clone(),
            cancel_flags: self.cancel_flags.clone(),
        };
        let handle = tokio::spawn(task.run(reporter));
        self.executions
            .lock()
            .map_err(|e| ApiError::InternalError(format!("执行句柄锁获取失败: {}", e)))?
            .insert(session_id.to_string(), handle);

        info!(session_id, batch_id = %batch_id, "执行批次已启动");
        Ok(batch_id)
    }

    /// 等待执行批次结束（CLI / 测试使用）
    pub async fn wait_for_execution(&self, session_id: &str) -> ApiResult<()> {
        let handle = self
            .executions
            .lock()
            .map_err(|e| ApiError::InternalError(format!("执行句柄锁获取失败: {}", e)))?
            .remove(session_id);
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    /// 轮询会话状态与批次进度
    pub async fn poll_status(&self, session_id: &str) -> ApiResult<StatusReport> {
        Ok(StatusReport::from_session(self.get_session(session_id).await?))
    }

    /// 执行失败行（按行号升序）
    pub async fn failed_rows(&self, session_id: &str) -> ApiResult<Vec<FailedRow>> {
        let session_id = session_id.to_string();
        self.blocking(move |ctx| {
            ctx.store.get_session(&session_id)?;
            Ok(ctx.store.failed_rows(&session_id)?)
        })
        .await
    }

    // ==========================================
    // 取消与清理
    // ==========================================

    /// 取消会话: 停止后续分块并销毁工作集（已提交的记录保留）
    ///
    /// # 返回
    /// - true: 会话存在并已删除
    pub async fn cancel(&self, session_id: &str) -> ApiResult<bool> {
        if let Ok(flags) = self.cancel_flags.lock() {
            if let Some(flag) = flags.get(session_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
        let sid = session_id.to_string();
        let deleted = self.blocking(move |ctx| Ok(ctx.store.delete_session(&sid)?)).await?;
        info!(session_id, deleted, "导入会话已取消");
        Ok(deleted)
    }

    /// 删除已过期会话
    pub async fn purge_expired(&self) -> ApiResult<usize> {
        self.blocking(|ctx| Ok(ctx.store.purge_expired()?)).await
    }
}

// ==========================================
// ExecutionTask - 后台执行 + 终态写入 + 通知
// ==========================================
struct ExecutionTask {
    ctx: JobContext,
    session: ImportSession,
    chunk_size: usize,
    notifier: Arc<dyn Notifier>,
    cancel_flags: CancelFlags,
}

impl ExecutionTask {
    async fn run(self, reporter: BatchReporter) {
        let session_id = self.session.session_id.clone();
        let ctx = self.ctx.clone();
        let chunk_size = self.chunk_size;
        let job_reporter = reporter.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = ExecuteImportJob::new(ctx, job_reporter.session_id(), chunk_size)
                .and_then(|job| job.run(&job_reporter));
            if let Err(e) = job_reporter.finish() {
                warn!(error = %e, "执行批次结束标记写入失败");
            }
            result
        })
        .await;
        release_flag(&self.cancel_flags, &session_id);

        let result: Result<ImportResults, String> = match joined {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => Err(self.describe_failure(e)),
            Err(e) => Err(format!("执行任务异常退出: {}", e)),
        };

        if !self.session_alive() {
            info!(session_id = %session_id, "会话已取消，跳过终态写入与通知");
            return;
        }

        let outcome = match result {
            Ok(results) => match self.finalize_success(&results) {
                Ok(()) => ImportOutcome::Completed { results },
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "执行结果写入失败");
                    ImportOutcome::Failed { error: e.to_string() }
                }
            },
            Err(message) => {
                self.finalize_failure(&message);
                ImportOutcome::Failed { error: message }
            }
        };

        let notification = ImportNotification {
            session_id: session_id.clone(),
            team_id: self.session.team_id.clone(),
            user_id: self.session.user_id.clone(),
            entity_type: self.session.entity_type.clone(),
            original_filename: self.session.original_filename.clone(),
            outcome,
        };
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(session_id = %session_id, error = %e, "导入通知发送失败");
        }
    }

    fn describe_failure(&self, err: JobError) -> String {
        error!(session_id = %self.session.session_id, error = %err, "执行批次失败");
        err.to_string()
    }

    fn session_alive(&self) -> bool {
        match self.ctx.store.get_session(&self.session.session_id) {
            Ok(_) => true,
            Err(e) => !e.is_not_found(),
        }
    }

    fn finalize_success(&self, results: &ImportResults) -> ApiResult<()> {
        let session_id = &self.session.session_id;
        self.ctx.store.set_results(session_id, results)?;
        self.ctx.store.set_status(session_id, ImportStatus::Completed)?;
        info!(
            session_id = %session_id,
            created = results.created,
            updated = results.updated,
            skipped = results.skipped,
            failed = results.failed,
            "导入完成"
        );
        Ok(())
    }

    fn finalize_failure(&self, message: &str) {
        let session_id = &self.session.session_id;
        if let Err(e) = self.ctx.store.set_error(session_id, message) {
            error!(session_id = %session_id, error = %e, "失败原因写入失败");
        }
        if let Err(e) = self.ctx.store.set_status(session_id, ImportStatus::Failed) {
            error!(session_id = %session_id, error = %e, "失败状态写入失败");
        }
    }
}

// ==========================================
// 辅助函数
// ==========================================

fn release_flag(flags: &CancelFlags, session_id: &str) {
    if let Ok(mut flags) = flags.lock() {
        flags.remove(session_id);
    }
}

/// 审核类操作只允许在 MAPPING / REVIEWING 阶段，且无存活批次
fn require_reviewable(ctx: &JobContext, session_id: &str) -> ApiResult<ImportSession> {
    let session = ctx.store.get_session(session_id)?;
    if let ImportStatus::Importing | ImportStatus::Completed | ImportStatus::Failed = session.status {
        return Err(ApiError::BusinessRuleViolation(format!(
            "会话已进入 {} 阶段，修正不再可用",
            session.status
        )));
    }
    let stale_before = chrono::Utc::now() - chrono::Duration::seconds(BATCH_STALE_AFTER_SECS);
    if let Some(batch) = session
        .batch
        .as_ref()
        .filter(|b| b.active && b.heartbeat_at >= stale_before)
    {
        return Err(ApiError::BatchInProgress {
            session_id: session.session_id.clone(),
            batch_id: batch.batch_id.clone(),
        });
    }
    Ok(session)
}

/// 日期类字段列未显式指定格式时按全列探测
fn detect_column_date_format(
    ctx: &JobContext,
    session: &ImportSession,
    column: &ColumnData,
) -> ApiResult<Option<DateFormat>> {
    if column.date_format.is_some() || column.is_relationship() {
        return Ok(None);
    }
    let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
    let temporal = schema
        .field(&column.target)
        .map(|f| f.field_type.is_temporal())
        .unwrap_or(false);
    if !temporal {
        return Ok(None);
    }
    let cells = ctx.store.column_cells(&session.session_id, &column.source)?;
    let values: Vec<&str> = cells.iter().map(|c| c.raw.as_str()).collect();
    Ok(DateFormat::detect(&values).map(|(format, _)| format))
}

/// 修正后只重新校验受影响的原始值
fn revalidate_value(
    ctx: &JobContext,
    session: &ImportSession,
    source: &str,
    raw_value: &str,
    new_value: &str,
) -> ApiResult<()> {
    let Some(column) = session.mappings.get(source) else {
        return Ok(());
    };
    let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
    let Some(field) = validation_field(&schema, column) else {
        return Ok(());
    };
    let detected = detect_column_date_format(ctx, session, column)?;
    let issue = validator_for(column, detected).validate(&field, new_value);
    ctx.store
        .set_cell_issue(&session.session_id, source, raw_value, issue)?;
    Ok(())
}

/// 生效值变化后使依赖它的解析结果失效
///
/// # 规则
/// - 主匹配列 → 清空全部匹配结论
/// - 关联列 → 清除该关联的未解析计数（提交前重新解析）
fn invalidate_dependents(ctx: &JobContext, session: &ImportSession, source: &str) -> ApiResult<()> {
    let Some(column) = session.mappings.get(source) else {
        return Ok(());
    };
    if let Some(link) = &column.relationship {
        ctx.store.clear_unresolved(&session.session_id, link)?;
        return Ok(());
    }
    let schema = ctx.schemas.entity_schema(&session.team_id, &session.entity_type)?;
    let is_primary = schema
        .primary_match(&session.mappings)
        .map(|(_, primary)| primary.source == source)
        .unwrap_or(false);
    if is_primary {
        let reset = ctx.store.reset_match_actions(&session.session_id)?;
        info!(session_id = %session.session_id, source, reset, "主匹配列已修改，匹配结论已清空");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::Record;
    use crate::domain::types::MatchAction;
    use crate::engine::RecordingNotifier;
    use crate::repository::RecordRepository;

    async fn api() -> (ImportApi, Arc<RecordingNotifier>) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let api = ImportApi::from_connection(Arc::new(Mutex::new(conn)), notifier.clone())
            .await
            .unwrap();
        (api, notifier)
    }

    fn sheet(headers: &[&str], rows: &[&[&str]]) -> ParsedSheet {
        ParsedSheet::from_raw(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_unknown_entity_is_rejected() {
        let (api, _) = api().await;
        let err = api
            .create_session("team-1", "user-1", "spaceships", "x.csv")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_begin_review_requires_valid_mappings() {
        let (api, _) = api().await;
        let sid = api
            .create_session("team-1", "user-1", "companies", "c.csv")
            .await
            .unwrap();
        api.load_sheet(&sid, sheet(&["Website"], &[&["acme.com"]]))
            .await
            .unwrap();
        api.set_mappings(&sid, vec![ColumnData::field("Website", "nope")])
            .await
            .unwrap();

        let err = api.begin_review(&sid).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidMapping(ref issues) if !issues.is_empty()));
    }

    #[tokio::test]
    async fn test_full_flow_creates_and_notifies() {
        let (api, notifier) = api().await;
        let sid = api
            .create_session("team-1", "user-1", "companies", "companies.csv")
            .await
            .unwrap();
        api.load_sheet(&sid, sheet(&["Name"], &[&["Acme"], &["Globex"], &["Initech"]]))
            .await
            .unwrap();
        api.set_mappings(&sid, vec![ColumnData::field("Name", "name")])
            .await
            .unwrap();
        api.begin_review(&sid).await.unwrap();

        let preview = api.preview(&sid).await.unwrap();
        assert_eq!(preview.unresolved_count, 3);

        api.start_execution(&sid).await.unwrap();
        api.wait_for_execution(&sid).await.unwrap();

        let status = api.poll_status(&sid).await.unwrap();
        assert_eq!(status.status, ImportStatus::Completed);
        let results = status.results.unwrap();
        assert_eq!(results.created, 3);
        assert_eq!(results.total(), 3);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_success());
        assert_eq!(api.context().records.count("team-1", "companies").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_primary_column_correction_resets_matches() {
        let (api, _) = api().await;
        let records = api.context().records.clone();
        let mut existing = Record::new_import("team-1", "companies", "user-0");
        existing
            .fields
            .insert("name".to_string(), serde_json::Value::String("Acme".into()));
        let existing_id = existing.id.clone();
        records.insert(&existing).unwrap();

        let sid = api
            .create_session("team-1", "user-1", "companies", "c.csv")
            .await
            .unwrap();
        api.load_sheet(&sid, sheet(&["ID", "Name"], &[&["wrong-id", "Acme"]]))
            .await
            .unwrap();
        api.set_mappings(
            &sid,
            vec![ColumnData::field("ID", "id"), ColumnData::field("Name", "name")],
        )
        .await
        .unwrap();
        api.begin_review(&sid).await.unwrap();

        api.resolve_matches(&sid).await.unwrap();
        assert_eq!(api.preview(&sid).await.unwrap().skip_count, 1);

        api.apply_correction(&sid, "ID", "wrong-id", &existing_id)
            .await
            .unwrap();
        let preview = api.preview(&sid).await.unwrap();
        assert_eq!(preview.unresolved_count, 1);

        api.resolve_matches(&sid).await.unwrap();
        let row = &api.preview(&sid).await.unwrap().sample_rows[0];
        assert_eq!(row.match_action, Some(MatchAction::Update));
        assert_eq!(row.matched_id.as_deref(), Some(existing_id.as_str()));
    }

    #[tokio::test]
    async fn test_cancel_destroys_session() {
        let (api, _) = api().await;
        let sid = api
            .create_session("team-1", "user-1", "companies", "c.csv")
            .await
            .unwrap();
        assert!(api.cancel(&sid).await.unwrap());
        assert!(matches!(api.poll_status(&sid).await, Err(ApiError::NotFound(_))));
        assert!(!api.cancel(&sid).await.unwrap());
    }
}
