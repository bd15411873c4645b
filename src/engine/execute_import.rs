// ==========================================
// CRM 导入引擎 - 提交执行（ExecuteImportJob）
// ==========================================
// 流程: 按行号分块 → 逐行 Create / Update / Skip → 关联落库 → 汇总结果
// 红线: 原子单元是行，不是整个导入；单行失败记入 failed_rows 后继续
// 红线: 每行恰好落入 created / updated / skipped / failed 之一
// 红线: 自动新建的关联记录按 (关联, 名称) 在同一次运行内去重，首个创建者胜出
// 红线: 块内顺序执行，去重缓存只在本次运行内有效
// ==========================================

use crate::domain::entity_link::{EntityLink, ImportField};
use crate::domain::import::{
    ImportResults, ImportRow, ImportSession, MatchResolution, RelationshipAction,
    RelationshipMatch, RowOutcome,
};
use crate::domain::mapping::ColumnData;
use crate::domain::record::Record;
use crate::domain::types::FieldType;
use crate::engine::batch::{chunk_ranges, BatchReporter, JobContext};
use crate::engine::error::{JobError, JobResult};
use crate::engine::match_resolver::MatchResolver;
use crate::engine::storage_strategy::strategy_for;
use crate::importer::date_format::{DateFormat, TimestampFormat};
use crate::importer::value_validator::{normalize_domain, split_tokens};
use crate::repository::RowWritePlan;
use crate::schema::EntitySchema;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 写入存储的规范日期 / 时间格式
const STORED_DATE_FORMAT: &str = "%Y-%m-%d";
const STORED_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 运行内去重键: (关联 key, 规范化名称)
type DedupKey = (String, String);

fn dedup_key(link: &str, name: &str) -> DedupKey {
    (link.to_string(), name.trim().to_lowercase())
}

pub struct ExecuteImportJob {
    ctx: JobContext,
    session: ImportSession,
    schema: Arc<EntitySchema>,
    chunk_size: usize,
    date_formats: HashMap<String, DateFormat>,
    created_related: HashMap<DedupKey, String>,
    results: ImportResults,
}

impl ExecuteImportJob {
    /// 加载会话与模式（失败即会话级失败）
    pub fn new(ctx: JobContext, session_id: &str, chunk_size: usize) -> JobResult<Self> {
        let session = ctx.store.get_session(session_id).map_err(|e| {
            if e.is_not_found() {
                JobError::SessionNotFound(session_id.to_string())
            } else {
                JobError::Repository(e)
            }
        })?;
        let schema = ctx
            .schemas
            .entity_schema(&session.team_id, &session.entity_type)?;

        // 日期列未显式指定格式时按全列探测
        let mut date_formats = HashMap::new();
        for column in session.mappings.field_columns() {
            let Some(field) = schema.field(&column.target) else {
                continue;
            };
            if !field.field_type.is_temporal() {
                continue;
            }
            let format = match column.date_format {
                Some(format) => format,
                None => {
                    let cells = ctx.store.column_cells(session_id, &column.source)?;
                    let values: Vec<&str> = cells.iter().map(|c| c.raw.as_str()).collect();
                    DateFormat::detect(&values).map(|(f, _)| f).unwrap_or_default()
                }
            };
            date_formats.insert(column.source.clone(), format);
        }

        Ok(Self {
            ctx,
            session,
            schema,
            chunk_size,
            date_formats,
            created_related: HashMap::new(),
            results: ImportResults::default(),
        })
    }

    /// 执行全部分块
    ///
    /// # 返回
    /// - Ok(results): 已持久化的最终结果
    /// - Err: 会话级失败（取消 / 会话丢失 / 模式错误）
    #[instrument(skip(self, reporter), fields(session_id = %self.session.session_id, batch_id = %reporter.batch_id()))]
    pub fn run(mut self, reporter: &BatchReporter) -> JobResult<ImportResults> {
        let session_id = self.session.session_id.clone();
        let row_numbers = self.ctx.store.row_numbers(&session_id)?;
        let ranges = chunk_ranges(&row_numbers, self.chunk_size);
        info!(rows = row_numbers.len(), chunks = ranges.len(), "开始执行导入");

        for (from, to) in ranges {
            reporter.ensure_active()?;
            let rows = self.ctx.store.rows_in_range(&session_id, from, to)?;
            for row in &rows {
                let outcome = match self.process_row(row) {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_row_level() => {
                        warn!(row_number = row.row_number, error = %e, "行执行失败");
                        self.ctx
                            .store
                            .add_failed_row(&session_id, row.row_number, &e.to_string())?;
                        RowOutcome::Failed
                    }
                    Err(e) => return Err(e),
                };
                self.results.record(outcome);
            }
            self.ctx.store.set_results(&session_id, &self.results)?;
            reporter.tick(rows.len() as u64)?;
        }

        info!(
            created = self.results.created,
            updated = self.results.updated,
            skipped = self.results.skipped,
            failed = self.results.failed,
            auto_created = self.created_related.len(),
            "导入执行完成"
        );
        Ok(self.results)
    }

    /// 处理单行
    fn process_row(&mut self, row: &ImportRow) -> JobResult<RowOutcome> {
        let resolution = match row.match_resolution() {
            Some(resolution) => resolution,
            None => MatchResolver::new(self.ctx.records.as_ref(), &self.schema, &self.session.mappings)
                .resolve(row)?,
        };

        let (mut record, is_update) = match resolution {
            MatchResolution::Skip => return Ok(RowOutcome::Skipped),
            MatchResolution::Update(id) => {
                match self
                    .ctx
                    .records
                    .find_by_id(&self.session.team_id, &self.session.entity_type, &id)?
                {
                    Some(existing) => (existing, true),
                    None => {
                        debug!(row_number = row.row_number, matched_id = %id, "待更新记录已不存在，按跳过处理");
                        return Ok(RowOutcome::Skipped);
                    }
                }
            }
            MatchResolution::Create => (
                Record::new_import(&self.session.team_id, &self.session.entity_type, &self.session.user_id),
                false,
            ),
        };

        self.apply_fields(row, &mut record);
        if !is_update {
            if let Some(missing) = self
                .schema
                .required_fields()
                .find(|f| record.get(&f.key).is_none())
            {
                return Err(JobError::MissingRequiredField(missing.label.clone()));
            }
        }

        let mut plan = RowWritePlan::new(record, is_update);
        let pending = self.apply_relationships(row, &mut plan)?;

        match self.ctx.records.persist_row(&plan) {
            Ok(()) => {
                self.created_related.extend(pending);
                Ok(if is_update {
                    RowOutcome::Updated
                } else {
                    RowOutcome::Created
                })
            }
            Err(e) if is_update && e.is_not_found() => {
                debug!(row_number = row.row_number, "更新时记录已被删除，按跳过处理");
                Ok(RowOutcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 写入映射字段（只写有值的列；跳过的值不出现；未映射字段保持原值）
    fn apply_fields(&self, row: &ImportRow, record: &mut Record) {
        for column in self.session.mappings.field_columns() {
            if !self.schema.is_writable(&column.target) {
                continue;
            }
            let Some(field) = self.schema.field(&column.target) else {
                continue;
            };
            let Some(value) = row.present_value(&column.source) else {
                continue;
            };
            let date_format = self.date_formats.get(&column.source).copied();
            match convert_value(field, column, date_format, value) {
                Some(converted) => set_field(record, field, converted),
                None => debug!(
                    row_number = row.row_number,
                    field = %field.key,
                    "值无法按字段类型转换，已忽略"
                ),
            }
        }
        record.updated_at = Utc::now();
    }

    /// 按存储策略挂接关联
    ///
    /// # 返回
    /// - 本行新建的关联记录（落库成功后并入去重缓存）
    fn apply_relationships(&self, row: &ImportRow, plan: &mut RowWritePlan) -> JobResult<Vec<(DedupKey, String)>> {
        let mut pending: Vec<(DedupKey, String)> = Vec::new();

        for link_key in self.session.mappings.mapped_links() {
            let Some(link) = self.schema.link(&link_key) else {
                continue;
            };
            let strategy = strategy_for(link.storage_type);
            let limit = if strategy.is_multi() { usize::MAX } else { 1 };

            let mut target_ids: Vec<String> = Vec::new();
            for m in row.relationships_for(&link_key).take(limit) {
                let id = match m.action {
                    RelationshipAction::Existing => m.id.clone(),
                    RelationshipAction::Create => Some(self.related_id(link, m, plan, &mut pending)?),
                };
                if let Some(id) = id {
                    if !target_ids.contains(&id) {
                        target_ids.push(id);
                    }
                }
            }

            if !target_ids.is_empty() {
                strategy.attach(link, plan, &target_ids)?;
            }
        }
        Ok(pending)
    }

    /// 取得（或规划新建）关联记录 id
    fn related_id(
        &self,
        link: &EntityLink,
        m: &RelationshipMatch,
        plan: &mut RowWritePlan,
        pending: &mut Vec<(DedupKey, String)>,
    ) -> JobResult<String> {
        let name = m
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| JobError::RelationshipError {
                relationship: link.key.clone(),
                message: "新建关联缺少名称".to_string(),
            })?;

        let key = dedup_key(&link.key, name);
        if let Some(id) = self.created_related.get(&key) {
            return Ok(id.clone());
        }
        if let Some((_, id)) = pending.iter().find(|(k, _)| *k == key) {
            return Ok(id.clone());
        }

        let target_schema = self
            .ctx
            .schemas
            .entity_schema(&self.session.team_id, &link.target_entity)?;
        let mut related = Record::new_import(&self.session.team_id, &link.target_entity, &self.session.user_id);
        set_text(&target_schema, &mut related, &target_schema.name_field, name);
        if let Some(matcher) = link.find_matcher(&m.matcher) {
            if matcher.target_field != target_schema.name_field && matcher.target_field != "id" {
                set_text(&target_schema, &mut related, &matcher.target_field, name);
            }
        }

        let id = related.id.clone();
        debug!(relationship = %link.key, name, id = %id, "规划新建关联记录");
        plan.related.push(related);
        pending.push((key, id.clone()));
        Ok(id)
    }
}

fn set_field(record: &mut Record, field: &ImportField, value: Value) {
    if field.custom {
        record.custom_fields.insert(field.key.clone(), value);
    } else {
        record.fields.insert(field.key.clone(), value);
    }
}

/// 新建关联记录时写入名称 / 匹配值
fn set_text(schema: &EntitySchema, record: &mut Record, key: &str, value: &str) {
    let Some(field) = schema.field(key) else {
        record.fields.insert(key.to_string(), Value::String(value.to_string()));
        return;
    };
    let text = if field.field_type == FieldType::Domain {
        normalize_domain(value)
    } else {
        value.to_string()
    };
    let converted = if field.multi_value {
        Value::Array(vec![Value::String(text)])
    } else {
        Value::String(text)
    };
    set_field(record, field, converted);
}

/// 生效值 → 存储值
///
/// # 返回
/// - None: 按字段类型无法解析（不写入）
fn convert_value(
    field: &ImportField,
    column: &ColumnData,
    date_format: Option<DateFormat>,
    value: &str,
) -> Option<Value> {
    if field.multi_value {
        let tokens: Vec<Value> = split_tokens(value)
            .into_iter()
            .filter_map(|token| convert_single(field, column, date_format, token))
            .collect();
        return (!tokens.is_empty()).then_some(Value::Array(tokens));
    }
    convert_single(field, column, date_format, value)
}

fn convert_single(
    field: &ImportField,
    column: &ColumnData,
    date_format: Option<DateFormat>,
    value: &str,
) -> Option<Value> {
    let v = value.trim();
    let date_format = date_format.or(column.date_format).unwrap_or_default();
    match field.field_type {
        FieldType::Number => {
            let n = column.number_format.unwrap_or_default().parse(v)?;
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Some(Value::from(n as i64))
            } else {
                serde_json::Number::from_f64(n).map(Value::Number)
            }
        }
        FieldType::Date => date_format
            .parse(v)
            .map(|d| Value::String(d.format(STORED_DATE_FORMAT).to_string())),
        FieldType::DateTime => TimestampFormat(date_format)
            .parse(v)
            .map(|dt| Value::String(dt.format(STORED_DATETIME_FORMAT).to_string())),
        FieldType::Domain => Some(Value::String(normalize_domain(v))),
        FieldType::Email => Some(Value::String(v.to_lowercase())),
        FieldType::Choice | FieldType::MultiChoice => {
            if field.options.is_empty() {
                return Some(Value::String(v.to_string()));
            }
            field.find_option(v).map(|o| Value::String(o.to_string()))
        }
        FieldType::Text | FieldType::Phone | FieldType::Url | FieldType::Record => {
            Some(Value::String(v.to_string()))
        }
    }
}
