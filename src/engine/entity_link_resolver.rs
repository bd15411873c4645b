// ==========================================
// CRM 导入引擎 - 关联解析（ValidateColumnJob）
// ==========================================
// 规则（按匹配器行为）:
// - MatchOnly: 命中 → existing；未命中 → 不写条目（计入 unresolved）
// - MatchOrCreate: 命中 → existing；未命中且 can_create → create；否则不写
// - Create: 总是 create，不查重（同名去重只在执行期同一运行内进行）
// 红线: 只替换本关联的条目，同一行其他关联的条目原样保留
// ==========================================

use crate::domain::entity_link::{EntityLink, RelationshipMatcher};
use crate::domain::import::{ImportRow, RelationshipAction, RelationshipMatch};
use crate::domain::mapping::ColumnMappings;
use crate::domain::types::{MatchBehavior, StorageType};
use crate::engine::batch::{BatchReporter, JobContext};
use crate::engine::column_analyzer::{validation_field, validator_for};
use crate::engine::error::{JobError, JobResult};
use crate::importer::date_format::DateFormat;
use crate::importer::value_validator::split_tokens;
use crate::repository::RecordRepository;
use crate::schema::EntitySchema;
use tracing::{debug, instrument};

/// 单行单关联的解析结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Resolved,   // 至少一个条目
    Empty,      // 所有映射列均为空
    Unresolved, // 有值但全部未解析
}

pub struct EntityLinkResolver<'a> {
    records: &'a dyn RecordRepository,
    team_id: &'a str,
    link: EntityLink,
    matchers: Vec<RelationshipMatcher>,
}

impl<'a> EntityLinkResolver<'a> {
    /// # 返回
    /// - Err(RelationshipError): 关联未在模式中声明
    pub fn new(
        records: &'a dyn RecordRepository,
        schema: &'a EntitySchema,
        mappings: &ColumnMappings,
        link_key: &str,
    ) -> JobResult<Self> {
        let link = schema
            .link(link_key)
            .cloned()
            .ok_or_else(|| JobError::RelationshipError {
                relationship: link_key.to_string(),
                message: "未声明的关联".to_string(),
            })?;
        Ok(Self {
            records,
            team_id: &schema.team_id,
            matchers: schema.relationship_matchers(mappings, link_key),
            link,
        })
    }

    pub fn link(&self) -> &EntityLink {
        &self.link
    }

    fn find(&self, rm: &RelationshipMatcher, value: &str) -> JobResult<Option<String>> {
        Ok(self.records.find_by_field(
            self.team_id,
            &self.link.target_entity,
            &rm.matcher.target_field,
            value,
            rm.matcher.key,
        )?)
    }

    fn resolve_value(&self, rm: &RelationshipMatcher, value: &str) -> JobResult<Option<RelationshipMatch>> {
        let key = &self.link.key;
        let field = &rm.matcher.field;
        if rm.behavior() == MatchBehavior::Create {
            return Ok(Some(RelationshipMatch::create(key, value, field)));
        }
        if let Some(id) = self.find(rm, value)? {
            return Ok(Some(RelationshipMatch::existing(key, id, field)));
        }
        Ok(rm
            .creates_when_missing()
            .then(|| RelationshipMatch::create(key, value, field)))
    }

    /// 重新解析一行的本关联条目
    pub fn resolve_row(&self, row: &mut ImportRow) -> JobResult<LinkOutcome> {
        let key = self.link.key.as_str();
        row.relationships.retain(|m| m.relationship != key);

        let multi = self.link.storage_type == StorageType::MorphToMany;
        let mut saw_value = false;
        let mut resolved: Vec<RelationshipMatch> = Vec::new();

        for rm in &self.matchers {
            let Some(value) = row.present_value(&rm.source) else {
                continue;
            };
            saw_value = true;
            let tokens = if multi { split_tokens(value) } else { vec![value] };
            for token in tokens {
                let Some(found) = self.resolve_value(rm, token)? else {
                    continue;
                };
                if !resolved.iter().any(|m| same_target(m, &found)) {
                    resolved.push(found);
                }
            }
        }

        let outcome = if !resolved.is_empty() {
            LinkOutcome::Resolved
        } else if saw_value {
            LinkOutcome::Unresolved
        } else {
            LinkOutcome::Empty
        };
        row.relationships.extend(resolved);
        Ok(outcome)
    }
}

fn same_target(a: &RelationshipMatch, b: &RelationshipMatch) -> bool {
    match (a.action, b.action) {
        (RelationshipAction::Existing, RelationshipAction::Existing) => a.id == b.id,
        (RelationshipAction::Create, RelationshipAction::Create) => {
            let norm = |m: &RelationshipMatch| m.name.as_deref().map(|n| n.trim().to_lowercase());
            norm(a) == norm(b)
        }
        _ => false,
    }
}

// ==========================================
// ValidateColumnJob - 列校验 + 关联解析（分块）
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnChunkReport {
    pub processed: u64,
    pub unresolved: u64,
}

pub struct ValidateColumnJob {
    ctx: JobContext,
    source: String,
    detected_date_format: Option<DateFormat>,
}

impl ValidateColumnJob {
    /// # 参数
    /// - detected_date_format: 全列探测结果（列上未显式设置格式时使用）
    pub fn new(ctx: JobContext, source: &str, detected_date_format: Option<DateFormat>) -> Self {
        Self {
            ctx,
            source: source.to_string(),
            detected_date_format,
        }
    }

    #[instrument(skip(self, reporter), fields(session_id = %reporter.session_id(), source = %self.source, from, to))]
    pub fn run_chunk(&self, reporter: &BatchReporter, from: i64, to: i64) -> JobResult<ColumnChunkReport> {
        reporter.ensure_active()?;
        let session = self.ctx.store.get_session(reporter.session_id())?;
        let schema = self
            .ctx
            .schemas
            .entity_schema(&session.team_id, &session.entity_type)?;
        let column = session
            .mappings
            .get(&self.source)
            .cloned()
            .ok_or_else(|| JobError::Other(anyhow::anyhow!("列未映射: {}", self.source)))?;

        let field = validation_field(&schema, &column);
        let validator = validator_for(&column, self.detected_date_format);
        let resolver = match column.relationship.as_deref() {
            Some(link) => Some(EntityLinkResolver::new(
                self.ctx.records.as_ref(),
                &schema,
                &session.mappings,
                link,
            )?),
            None => None,
        };

        let mut rows = self.ctx.store.rows_in_range(&session.session_id, from, to)?;
        let mut report = ColumnChunkReport::default();
        for row in rows.iter_mut() {
            if let Some(field) = &field {
                let issue = row
                    .value(&self.source)
                    .and_then(|v| validator.validate(field, v));
                match issue {
                    Some(issue) => {
                        row.validation.insert(self.source.clone(), issue);
                    }
                    None => {
                        row.validation.remove(&self.source);
                    }
                }
            }
            if let Some(resolver) = &resolver {
                if resolver.resolve_row(row)? == LinkOutcome::Unresolved {
                    report.unresolved += 1;
                }
            }
            report.processed += 1;
        }

        self.ctx.store.update_rows(&session.session_id, &rows)?;
        reporter.tick(report.processed)?;
        debug!(processed = report.processed, unresolved = report.unresolved, "列校验分块完成");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mapping::ColumnData;
    use crate::domain::record::Record;
    use crate::repository::SqliteRecordRepository;
    use crate::schema::builtin_definition;
    use indexmap::IndexMap;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn repo() -> SqliteRecordRepository {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        SqliteRecordRepository::new(Arc::new(Mutex::new(conn)))
    }

    fn company(repo: &SqliteRecordRepository, name: &str, domain: &str) -> String {
        let mut r = Record::new_import("t1", "companies", "u1");
        r.fields.insert("name".into(), json!(name));
        r.custom_fields.insert("domains".into(), json!([domain]));
        repo.insert(&r).unwrap();
        r.id
    }

    fn row(values: &[(&str, &str)]) -> ImportRow {
        let raw: IndexMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImportRow::new(2, raw)
    }

    #[test]
    fn test_name_matcher_always_creates() {
        let repo = repo();
        company(&repo, "Acme", "acme.com");
        let schema = EntitySchema::build("t1", builtin_definition("people").unwrap(), &[]);
        let mappings = ColumnMappings::new(vec![ColumnData::relationship("Company", "company", "name")]);
        let resolver = EntityLinkResolver::new(&repo, &schema, &mappings, "company").unwrap();

        let mut r = row(&[("Company", "Acme")]);
        assert_eq!(resolver.resolve_row(&mut r).unwrap(), LinkOutcome::Resolved);
        assert_eq!(r.relationships.len(), 1);
        assert_eq!(r.relationships[0].action, RelationshipAction::Create);
        assert_eq!(r.relationships[0].name.as_deref(), Some("Acme"));
    }

    #[test]
    fn test_id_miss_writes_nothing_and_is_unresolved() {
        let repo = repo();
        let existing = company(&repo, "Acme", "acme.com");
        let schema = EntitySchema::build("t1", builtin_definition("people").unwrap(), &[]);
        let mappings = ColumnMappings::new(vec![ColumnData::relationship("Company ID", "company", "id")]);
        let resolver = EntityLinkResolver::new(&repo, &schema, &mappings, "company").unwrap();

        let mut hit = row(&[("Company ID", existing.as_str())]);
        assert_eq!(resolver.resolve_row(&mut hit).unwrap(), LinkOutcome::Resolved);
        assert_eq!(hit.relationships[0].id.as_deref(), Some(existing.as_str()));

        let mut miss = row(&[("Company ID", "gone")]);
        assert_eq!(resolver.resolve_row(&mut miss).unwrap(), LinkOutcome::Unresolved);
        assert!(miss.relationships.is_empty());

        let mut empty = row(&[("Company ID", "")]);
        assert_eq!(resolver.resolve_row(&mut empty).unwrap(), LinkOutcome::Empty);
    }

    #[test]
    fn test_domain_match_or_create() {
        let repo = repo();
        let existing = company(&repo, "Acme", "acme.com");
        let schema = EntitySchema::build("t1", builtin_definition("people").unwrap(), &[]);
        let mappings = ColumnMappings::new(vec![ColumnData::relationship("Website", "company", "domain")]);
        let resolver = EntityLinkResolver::new(&repo, &schema, &mappings, "company").unwrap();

        let mut hit = row(&[("Website", "https://www.ACME.com/about")]);
        resolver.resolve_row(&mut hit).unwrap();
        assert_eq!(hit.relationships[0].id.as_deref(), Some(existing.as_str()));

        let mut miss = row(&[("Website", "newco.io")]);
        resolver.resolve_row(&mut miss).unwrap();
        assert_eq!(miss.relationships[0].action, RelationshipAction::Create);
        assert_eq!(miss.relationships[0].matcher, "domain");
    }

    #[test]
    fn test_other_links_are_preserved_and_rerun_replaces() {
        let repo = repo();
        let schema = EntitySchema::build("t1", builtin_definition("opportunities").unwrap(), &[]);
        let mappings = ColumnMappings::new(vec![
            ColumnData::relationship("Company", "company", "name"),
            ColumnData::relationship("Contact", "contact", "name"),
        ]);
        let companies = EntityLinkResolver::new(&repo, &schema, &mappings, "company").unwrap();
        let contacts = EntityLinkResolver::new(&repo, &schema, &mappings, "contact").unwrap();

        let mut r = row(&[("Company", "Acme"), ("Contact", "Ada")]);
        companies.resolve_row(&mut r).unwrap();
        contacts.resolve_row(&mut r).unwrap();
        companies.resolve_row(&mut r).unwrap();

        assert_eq!(r.relationships.len(), 2);
        assert_eq!(r.relationships_for("company").count(), 1);
        assert_eq!(r.relationships_for("contact").count(), 1);
    }

    #[test]
    fn test_morph_link_splits_and_dedups_tokens() {
        let repo = repo();
        let schema = EntitySchema::build("t1", builtin_definition("tasks").unwrap(), &[]);
        let mappings = ColumnMappings::new(vec![ColumnData::relationship("Companies", "companies", "name")]);
        let resolver = EntityLinkResolver::new(&repo, &schema, &mappings, "companies").unwrap();

        let mut r = row(&[("Companies", "Acme, Globex, acme")]);
        resolver.resolve_row(&mut r).unwrap();
        let names: Vec<&str> = r
            .relationships
            .iter()
            .filter_map(|m| m.name.as_deref())
            .collect();
        assert_eq!(names, vec!["Acme", "Globex"]);
    }

    #[test]
    fn test_unknown_link_is_error() {
        let repo = repo();
        let schema = EntitySchema::build("t1", builtin_definition("people").unwrap(), &[]);
        let err = EntityLinkResolver::new(&repo, &schema, &ColumnMappings::default(), "invoice")
            .err()
            .unwrap();
        assert!(matches!(err, JobError::RelationshipError { .. }));
    }
}
