// ==========================================
// CRM 导入引擎 - 行匹配解析（ResolveMatchesJob）
// ==========================================
// 规则:
// - 主匹配列未映射或值为空 → Create
// - 命中已有记录 → Update(matched_id)
// - 未命中: MatchOnly（如 id）→ Skip；MatchOrCreate（如 emails）→ Create
// 红线: 重新解析前先清空旧结论，保证幂等
// ==========================================

use crate::domain::entity_link::MatchableField;
use crate::domain::import::{ImportRow, MatchResolution};
use crate::domain::mapping::{ColumnData, ColumnMappings};
use crate::domain::types::MatchBehavior;
use crate::engine::batch::{BatchReporter, JobContext};
use crate::engine::error::JobResult;
use crate::importer::value_validator::split_tokens;
use crate::repository::RecordRepository;
use crate::schema::EntitySchema;
use tracing::{debug, instrument};

pub struct MatchResolver<'a> {
    records: &'a dyn RecordRepository,
    schema: &'a EntitySchema,
    primary: Option<(MatchableField, ColumnData)>,
}

impl<'a> MatchResolver<'a> {
    /// # 参数
    /// - mappings: 会话映射（决定主匹配列）
    pub fn new(records: &'a dyn RecordRepository, schema: &'a EntitySchema, mappings: &ColumnMappings) -> Self {
        let primary = schema
            .primary_match(mappings)
            .map(|(matcher, column)| (matcher, column.clone()));
        Self {
            records,
            schema,
            primary,
        }
    }

    /// 当前使用的主匹配字段
    pub fn primary_field(&self) -> Option<&str> {
        self.primary.as_ref().map(|(m, _)| m.field.as_str())
    }

    /// 解析单行
    pub fn resolve(&self, row: &ImportRow) -> JobResult<MatchResolution> {
        let Some((matcher, column)) = &self.primary else {
            return Ok(MatchResolution::Create);
        };
        let Some(value) = row.present_value(&column.source) else {
            return Ok(MatchResolution::Create);
        };

        let field_is_multi = self
            .schema
            .field(&matcher.field)
            .map(|f| f.multi_value)
            .unwrap_or(false);
        let candidates: Vec<&str> = if field_is_multi {
            split_tokens(value)
        } else {
            vec![value]
        };

        for candidate in candidates {
            if let Some(id) = self.records.find_by_field(
                &self.schema.team_id,
                &self.schema.entity_type,
                &matcher.target_field,
                candidate,
                matcher.key,
            )? {
                return Ok(MatchResolution::Update(id));
            }
        }

        Ok(match matcher.behavior {
            MatchBehavior::MatchOnly => MatchResolution::Skip,
            MatchBehavior::MatchOrCreate | MatchBehavior::Create => MatchResolution::Create,
        })
    }

    /// 整体改写一批行的匹配结论（先清空，再计算）
    pub fn resolve_rows(&self, rows: &mut [ImportRow]) -> JobResult<()> {
        for row in rows.iter_mut() {
            row.reset_resolution();
            let resolution = self.resolve(row)?;
            row.apply_resolution(&resolution);
        }
        Ok(())
    }
}

// ==========================================
// ResolveMatchesJob - 分块执行
// ==========================================
pub struct ResolveMatchesJob {
    ctx: JobContext,
}

impl ResolveMatchesJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// 处理行号区间 [from, to] 并写回
    ///
    /// # 返回
    /// - 处理行数
    #[instrument(skip(self, reporter), fields(session_id = %reporter.session_id(), from, to))]
    pub fn run_chunk(&self, reporter: &BatchReporter, from: i64, to: i64) -> JobResult<u64> {
        reporter.ensure_active()?;
        let session = self.ctx.store.get_session(reporter.session_id())?;
        let schema = self
            .ctx
            .schemas
            .entity_schema(&session.team_id, &session.entity_type)?;
        let resolver = MatchResolver::new(self.ctx.records.as_ref(), &schema, &session.mappings);

        let mut rows = self.ctx.store.rows_in_range(&session.session_id, from, to)?;
        resolver.resolve_rows(&mut rows)?;
        self.ctx.store.update_rows(&session.session_id, &rows)?;

        let processed = rows.len() as u64;
        reporter.tick(processed)?;
        debug!(processed, primary = ?resolver.primary_field(), "行匹配分块完成");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::Record;
    use crate::domain::types::MatchAction;
    use crate::repository::SqliteRecordRepository;
    use crate::schema::builtin_definition;
    use indexmap::IndexMap;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn setup() -> (SqliteRecordRepository, EntitySchema) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let repo = SqliteRecordRepository::new(Arc::new(Mutex::new(conn)));
        let schema = EntitySchema::build("t1", builtin_definition("people").unwrap(), &[]);
        (repo, schema)
    }

    fn row(n: i64, values: &[(&str, &str)]) -> ImportRow {
        let raw: IndexMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImportRow::new(n, raw)
    }

    fn person(email: &str) -> Record {
        let mut r = Record::new_import("t1", "people", "u1");
        r.fields.insert("name".into(), json!("Ada"));
        r.custom_fields.insert("emails".into(), json!([email]));
        r
    }

    #[test]
    fn test_id_rules() {
        let (repo, schema) = setup();
        let existing = person("ada@x.com");
        repo.insert(&existing).unwrap();

        let mappings = ColumnMappings::new(vec![
            ColumnData::field("ID", "id"),
            ColumnData::field("Name", "name"),
        ]);
        let resolver = MatchResolver::new(&repo, &schema, &mappings);

        let found = resolver.resolve(&row(2, &[("ID", existing.id.as_str())])).unwrap();
        assert_eq!(found, MatchResolution::Update(existing.id.clone()));

        let missing = resolver.resolve(&row(3, &[("ID", "stale-export-id")])).unwrap();
        assert_eq!(missing, MatchResolution::Skip);
        assert_eq!(missing.matched_id(), None);

        let empty = resolver.resolve(&row(4, &[("ID", "  ")])).unwrap();
        assert_eq!(empty, MatchResolution::Create);
    }

    #[test]
    fn test_email_match_or_create() {
        let (repo, schema) = setup();
        let existing = person("ada@x.com");
        repo.insert(&existing).unwrap();

        let mappings = ColumnMappings::new(vec![ColumnData::field("Email", "emails")]);
        let resolver = MatchResolver::new(&repo, &schema, &mappings);
        assert_eq!(resolver.primary_field(), Some("emails"));

        let hit = resolver
            .resolve(&row(2, &[("Email", "other@y.com, ADA@x.com")]))
            .unwrap();
        assert_eq!(hit, MatchResolution::Update(existing.id.clone()));

        let miss = resolver.resolve(&row(3, &[("Email", "new@x.com")])).unwrap();
        assert_eq!(miss, MatchResolution::Create);
    }

    #[test]
    fn test_resolve_rows_is_idempotent_from_dirty_state() {
        let (repo, schema) = setup();
        let mappings = ColumnMappings::new(vec![ColumnData::field("ID", "id")]);
        let resolver = MatchResolver::new(&repo, &schema, &mappings);

        let mut dirty = row(2, &[("ID", "")]);
        dirty.apply_resolution(&MatchResolution::Update("ghost".into()));
        let mut rows = vec![dirty, row(3, &[("ID", "nope")])];

        resolver.resolve_rows(&mut rows).unwrap();
        let first = rows.clone();
        resolver.resolve_rows(&mut rows).unwrap();

        assert_eq!(rows, first);
        assert_eq!(rows[0].match_action, Some(MatchAction::Create));
        assert_eq!(rows[0].matched_id, None);
        assert_eq!(rows[1].match_action, Some(MatchAction::Skip));
    }

    #[test]
    fn test_no_primary_column_creates() {
        let (repo, schema) = setup();
        let mappings = ColumnMappings::new(vec![ColumnData::field("Name", "name")]);
        let resolver = MatchResolver::new(&repo, &schema, &mappings);
        assert_eq!(resolver.primary_field(), None);
        assert_eq!(
            resolver.resolve(&row(2, &[("Name", "Ada")])).unwrap(),
            MatchResolution::Create
        );
    }
}
