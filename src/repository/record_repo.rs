// ==========================================
// CRM 导入引擎 - CRM 记录仓储
// ==========================================
// 存储: crm_record / crm_custom_field_value / crm_record_link
// 红线: 一行导入的全部写入（关联新建 + 主记录 + 关联挂接）在同一事务内完成，
//       失败时整行回滚，不影响已提交的其他行
// ==========================================

use crate::domain::entity_link::MatchKey;
use crate::domain::record::{Record, RecordLink};
use crate::domain::types::CreationSource;
use crate::repository::error::{from_json, to_json, RepositoryError, RepositoryResult};
use crate::repository::{format_ts, parse_ts};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, Transaction};
use std::sync::{Arc, Mutex};

// ==========================================
// RowWritePlan - 单行写入计划
// ==========================================
#[derive(Debug, Clone)]
pub struct RowWritePlan {
    /// 需先新建的关联记录（运行内去重后的首个创建者）
    pub related: Vec<Record>,
    pub record: Record,
    pub is_update: bool,
    /// 主记录保存后挂接的多态关联
    pub links: Vec<RecordLink>,
    /// 主记录保存后写入的 record 类型自定义字段值 (field_code, target_id)
    pub custom_values: Vec<(String, String)>,
}

impl RowWritePlan {
    pub fn new(record: Record, is_update: bool) -> Self {
        Self {
            related: Vec::new(),
            record,
            is_update,
            links: Vec::new(),
            custom_values: Vec::new(),
        }
    }
}

// ==========================================
// RecordRepository Trait
// ==========================================
pub trait RecordRepository: Send + Sync {
    /// 按 id 查询（限定团队与实体类型）
    fn find_by_id(&self, team_id: &str, entity_type: &str, id: &str) -> RepositoryResult<Option<Record>>;

    /// 按字段值查询首个匹配记录 id（最早创建者优先）
    ///
    /// # 参数
    /// - field: 目标字段（内建或自定义，多值字段逐元素比较）
    /// - key: 比较前的规范化方式
    fn find_by_field(
        &self,
        team_id: &str,
        entity_type: &str,
        field: &str,
        value: &str,
        key: MatchKey,
    ) -> RepositoryResult<Option<String>>;

    /// 单事务执行一行写入计划
    fn persist_row(&self, plan: &RowWritePlan) -> RepositoryResult<()>;

    fn insert(&self, record: &Record) -> RepositoryResult<()>;

    fn delete(&self, id: &str) -> RepositoryResult<bool>;

    fn count(&self, team_id: &str, entity_type: &str) -> RepositoryResult<u64>;

    fn list(&self, team_id: &str, entity_type: &str) -> RepositoryResult<Vec<Record>>;

    fn links_of(&self, owner_id: &str) -> RepositoryResult<Vec<RecordLink>>;

    fn custom_value(&self, record_id: &str, field_code: &str) -> RepositoryResult<Option<String>>;
}

// ==========================================
// SqliteRecordRepository
// ==========================================
pub struct SqliteRecordRepository {
    conn: Arc<Mutex<Connection>>,
}

const RECORD_COLUMNS: &str = r#"
    id, team_id, entity_type, fields_json, custom_fields_json,
    creation_source, creator_id, created_at, updated_at
"#;

impl SqliteRecordRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn read_columns(row: &Row) -> rusqlite::Result<[Option<String>; 9]> {
        Ok([
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ])
    }

    fn into_record(columns: [Option<String>; 9]) -> RepositoryResult<Record> {
        let [id, team_id, entity_type, fields, custom, source, creator, created, updated] = columns;
        let required = |v: Option<String>, name: &str| {
            v.ok_or_else(|| RepositoryError::InternalError(format!("crm_record.{} 为空", name)))
        };
        Ok(Record {
            id: required(id, "id")?,
            team_id: required(team_id, "team_id")?,
            entity_type: required(entity_type, "entity_type")?,
            fields: from_json("fields", &required(fields, "fields_json")?)?,
            custom_fields: from_json("custom_fields", &required(custom, "custom_fields_json")?)?,
            creation_source: CreationSource::parse(&required(source, "creation_source")?),
            creator_id: creator,
            created_at: parse_ts(&required(created, "created_at")?)?,
            updated_at: parse_ts(&required(updated, "updated_at")?)?,
        })
    }

    fn insert_tx(tx: &Transaction, record: &Record) -> RepositoryResult<()> {
        tx.execute(
            r#"
            INSERT INTO crm_record (
                id, team_id, entity_type, fields_json, custom_fields_json,
                creation_source, creator_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.team_id,
                record.entity_type,
                to_json("fields", &record.fields)?,
                to_json("custom_fields", &record.custom_fields)?,
                record.creation_source.as_str(),
                record.creator_id,
                format_ts(record.created_at),
                format_ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn update_tx(tx: &Transaction, record: &Record) -> RepositoryResult<()> {
        let affected = tx.execute(
            r#"
            UPDATE crm_record
            SET fields_json = ?3, custom_fields_json = ?4, updated_at = ?5
            WHERE id = ?1 AND team_id = ?2
            "#,
            params![
                record.id,
                record.team_id,
                to_json("fields", &record.fields)?,
                to_json("custom_fields", &record.custom_fields)?,
                format_ts(record.updated_at),
            ],
        )?;
        if affected == 0 {
            return Err(RepositoryError::not_found("Record", &record.id));
        }
        Ok(())
    }
}

/// JSON 标量转文本（数值按原样输出）
fn sql_value_text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(s) => Some(s),
        SqlValue::Integer(i) => Some(i.to_string()),
        SqlValue::Real(f) => Some(f.to_string()),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

/// 可下推到 SQL 的值比较条件
///
/// # 说明
/// - SQLite lower() 只处理 ASCII，非 ASCII 的大小写不敏感比较留给逐条比较
fn sql_predicate(key: MatchKey, wanted: &str) -> Option<&'static str> {
    match key {
        MatchKey::Exact => Some("AND trim(j.value) = ?4"),
        MatchKey::CaseInsensitive if wanted.is_ascii() => Some("AND lower(trim(j.value)) = ?4"),
        MatchKey::CaseInsensitive | MatchKey::Domain | MatchKey::Phone => None,
    }
}

impl RecordRepository for SqliteRecordRepository {
    fn find_by_id(&self, team_id: &str, entity_type: &str, id: &str) -> RepositoryResult<Option<Record>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM crm_record WHERE id = ?1 AND team_id = ?2 AND entity_type = ?3",
            RECORD_COLUMNS
        );
        let columns = conn
            .query_row(&sql, params![id.trim(), team_id, entity_type], Self::read_columns)
            .optional()?;
        columns.map(Self::into_record).transpose()
    }

    fn find_by_field(
        &self,
        team_id: &str,
        entity_type: &str,
        field: &str,
        value: &str,
        key: MatchKey,
    ) -> RepositoryResult<Option<String>> {
        if field == "id" {
            return Ok(self
                .find_by_id(team_id, entity_type, value)?
                .map(|record| record.id));
        }

        let wanted = key.normalize(value);
        if wanted.is_empty() {
            return Ok(None);
        }

        let conn = self.get_conn()?;
        let path = format!("$.\"{}\"", field);
        let predicate = sql_predicate(key, &wanted);
        let sql = format!(
            r#"
            SELECT id, value FROM (
                SELECT r.id AS id, r.created_at AS created_at, j.value AS value
                FROM crm_record r, json_each(r.fields_json, ?3) j
                WHERE r.team_id = ?1 AND r.entity_type = ?2 {predicate}
                UNION ALL
                SELECT r.id AS id, r.created_at AS created_at, j.value AS value
                FROM crm_record r, json_each(r.custom_fields_json, ?3) j
                WHERE r.team_id = ?1 AND r.entity_type = ?2 {predicate}
            )
            ORDER BY created_at, id
            "#,
            predicate = predicate.unwrap_or("")
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut args: Vec<&dyn ToSql> = vec![&team_id, &entity_type, &path];
        if predicate.is_some() {
            args.push(&wanted);
        }
        let mut rows = stmt.query(args.as_slice())?;

        // SQL 已按值过滤时首行即结果；域名/电话规范化只能逐条比较
        while let Some(row) = rows.next()? {
            let candidate = sql_value_text(row.get::<_, SqlValue>(1)?);
            if candidate.is_some_and(|text| key.normalize(&text) == wanted) {
                return Ok(Some(row.get(0)?));
            }
        }
        Ok(None)
    }

    fn persist_row(&self, plan: &RowWritePlan) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        for related in &plan.related {
            Self::insert_tx(&tx, related)?;
        }

        if plan.is_update {
            Self::update_tx(&tx, &plan.record)?;
        } else {
            Self::insert_tx(&tx, &plan.record)?;
        }

        for link in &plan.links {
            tx.execute(
                "INSERT OR IGNORE INTO crm_record_link (owner_id, relationship, target_id) VALUES (?1, ?2, ?3)",
                params![link.owner_id, link.relationship, link.target_id],
            )?;
        }

        for (field_code, target_id) in &plan.custom_values {
            tx.execute(
                r#"
                INSERT INTO crm_custom_field_value (record_id, field_code, target_id) VALUES (?1, ?2, ?3)
                ON CONFLICT(record_id, field_code) DO UPDATE SET target_id = ?3
                "#,
                params![plan.record.id, field_code, target_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn insert(&self, record: &Record) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        Self::insert_tx(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM crm_record WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn count(&self, team_id: &str, entity_type: &str) -> RepositoryResult<u64> {
        let conn = self.get_conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM crm_record WHERE team_id = ?1 AND entity_type = ?2",
            params![team_id, entity_type],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn list(&self, team_id: &str, entity_type: &str) -> RepositoryResult<Vec<Record>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM crm_record WHERE team_id = ?1 AND entity_type = ?2 ORDER BY created_at, id",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map(params![team_id, entity_type], Self::read_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        columns.into_iter().map(Self::into_record).collect()
    }

    fn links_of(&self, owner_id: &str) -> RepositoryResult<Vec<RecordLink>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT owner_id, relationship, target_id FROM crm_record_link
            WHERE owner_id = ?1 ORDER BY relationship, target_id
            "#,
        )?;
        let links = stmt
            .query_map(params![owner_id], |r| {
                Ok(RecordLink {
                    owner_id: r.get(0)?,
                    relationship: r.get(1)?,
                    target_id: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    fn custom_value(&self, record_id: &str, field_code: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT target_id FROM crm_custom_field_value WHERE record_id = ?1 AND field_code = ?2",
                params![record_id, field_code],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup_repo() -> SqliteRecordRepository {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        SqliteRecordRepository::new(Arc::new(Mutex::new(conn)))
    }

    fn company(name: &str, domains: &[&str]) -> Record {
        let mut record = Record::new_import("t1", "companies", "u1");
        record.fields.insert("name".into(), json!(name));
        record.custom_fields.insert("domains".into(), json!(domains));
        record
    }

    #[test]
    fn test_find_by_field_normalises_values() {
        let repo = setup_repo();
        let acme = company("Acme", &["acme.com", "acme.io"]);
        repo.insert(&acme).unwrap();

        let found = repo
            .find_by_field("t1", "companies", "domains", "https://www.ACME.io/about", MatchKey::Domain)
            .unwrap();
        assert_eq!(found.as_deref(), Some(acme.id.as_str()));

        let by_name = repo
            .find_by_field("t1", "companies", "name", " acme ", MatchKey::CaseInsensitive)
            .unwrap();
        assert_eq!(by_name.as_deref(), Some(acme.id.as_str()));

        // 团队隔离
        assert!(repo
            .find_by_field("t2", "companies", "domains", "acme.com", MatchKey::Domain)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_by_field_filters_in_sql() {
        let repo = setup_repo();
        let mut first = Record::new_import("t1", "people", "u1");
        first.fields.insert("emails".into(), json!(["Ada@Example.com"]));
        first.fields.insert("city".into(), json!("Zürich"));
        first.fields.insert("employee_id".into(), json!(42));
        repo.insert(&first).unwrap();
        for i in 0..20 {
            let mut other = Record::new_import("t1", "people", "u1");
            other.fields.insert("emails".into(), json!([format!("p{}@example.com", i)]));
            repo.insert(&other).unwrap();
        }
        let mut later = Record::new_import("t1", "people", "u1");
        later.fields.insert("emails".into(), json!(["ada@example.com"]));
        later.created_at = first.created_at + chrono::Duration::seconds(1);
        repo.insert(&later).unwrap();

        // 同值多条时最早创建者优先
        let found = repo
            .find_by_field("t1", "people", "emails", " ADA@example.COM ", MatchKey::CaseInsensitive)
            .unwrap();
        assert_eq!(found.as_deref(), Some(first.id.as_str()));

        // 非 ASCII 大小写
        let found = repo
            .find_by_field("t1", "people", "city", "ZÜRICH", MatchKey::CaseInsensitive)
            .unwrap();
        assert_eq!(found.as_deref(), Some(first.id.as_str()));

        let found = repo
            .find_by_field("t1", "people", "employee_id", "42", MatchKey::Exact)
            .unwrap();
        assert_eq!(found.as_deref(), Some(first.id.as_str()));
        assert!(repo
            .find_by_field("t1", "people", "emails", "ADA@example.com", MatchKey::Exact)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_by_id_scoped_to_entity() {
        let repo = setup_repo();
        let acme = company("Acme", &[]);
        repo.insert(&acme).unwrap();

        assert!(repo.find_by_id("t1", "companies", &acme.id).unwrap().is_some());
        assert!(repo.find_by_id("t1", "people", &acme.id).unwrap().is_none());
        assert!(repo
            .find_by_field("t1", "companies", "id", "missing", MatchKey::Exact)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_persist_row_is_atomic() {
        let repo = setup_repo();
        let related = company("Same Corp", &[]);
        let mut person = Record::new_import("t1", "people", "u1");
        person.fields.insert("company_id".into(), json!(related.id));

        let mut plan = RowWritePlan::new(person.clone(), false);
        plan.related.push(related.clone());
        plan.links.push(RecordLink {
            owner_id: person.id.clone(),
            relationship: "companies".into(),
            target_id: "does-not-exist".into(),
        });

        // 关联目标不存在 → 外键失败，整行回滚（含关联新建）
        assert!(repo.persist_row(&plan).is_err());
        assert_eq!(repo.count("t1", "companies").unwrap(), 0);
        assert_eq!(repo.count("t1", "people").unwrap(), 0);

        plan.links[0].target_id = related.id.clone();
        repo.persist_row(&plan).unwrap();
        assert_eq!(repo.count("t1", "companies").unwrap(), 1);
        assert_eq!(repo.links_of(&person.id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_missing_record_fails() {
        let repo = setup_repo();
        let plan = RowWritePlan::new(company("Ghost", &[]), true);
        let err = repo.persist_row(&plan).unwrap_err();
        assert!(err.is_not_found());
    }
}
