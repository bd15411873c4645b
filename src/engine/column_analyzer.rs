// ==========================================
// CRM 导入引擎 - 列分析器
// ==========================================
// 职责: 从行存储实时重建单列唯一值频次表 + 值问题 + 日期格式探测
// 红线: 不读缓存快照，每次都反映最新修正/跳过
// 红线: 问题按生效值（修正优先）校验；被跳过的值不产生问题
// ==========================================

use crate::domain::analysis::{
    AnalysisPage, AnalysisQuery, ColumnAnalysis, SortDirection, SortField, UniqueValue,
    ValueFilter, ValueIssue,
};
use crate::domain::entity_link::ImportField;
use crate::domain::import::ImportSession;
use crate::domain::mapping::ColumnData;
use crate::domain::types::{FieldType, StorageType};
use crate::engine::error::JobResult;
use crate::importer::date_format::DateFormat;
use crate::importer::value_validator::ValueValidator;
use crate::repository::ImportStore;
use crate::schema::EntitySchema;
use indexmap::IndexMap;
use std::cmp::Ordering;

/// 关联列按匹配器推导校验字段（email/domain/phone 才有格式可言）
pub fn validation_field(schema: &EntitySchema, column: &ColumnData) -> Option<ImportField> {
    match column.relationship.as_deref() {
        None => schema.field(&column.target).cloned(),
        Some(_) => {
            let rm = schema.relationship_matcher(column)?;
            let field_type = match rm.matcher.field.as_str() {
                "email" => FieldType::Email,
                "domain" => FieldType::Domain,
                "phone" => FieldType::Phone,
                _ => return None,
            };
            let field = ImportField::new(&rm.matcher.field, &rm.matcher.label, field_type);
            Some(if rm.link.storage_type == StorageType::MorphToMany {
                field.multi_value()
            } else {
                field
            })
        }
    }
}

/// 列校验器: 列上显式设置的格式优先，其次探测结果
pub fn validator_for(column: &ColumnData, detected: Option<DateFormat>) -> ValueValidator {
    ValueValidator::new(
        column.date_format.or(detected).unwrap_or_default(),
        column.number_format.unwrap_or_default(),
    )
}

pub struct ColumnAnalyzer<'a> {
    store: &'a ImportStore,
    schema: &'a EntitySchema,
}

impl<'a> ColumnAnalyzer<'a> {
    pub fn new(store: &'a ImportStore, schema: &'a EntitySchema) -> Self {
        Self { store, schema }
    }

    /// 全量分析
    ///
    /// # 说明
    /// - 空白原始值不进入唯一值表
    /// - 按去空白后的原始值分组，与修正/跳过的匹配口径一致
    /// - 未映射列只统计频次，不校验
    pub fn analyze(&self, session: &ImportSession, source: &str) -> JobResult<ColumnAnalysis> {
        let cells = self.store.column_cells(&session.session_id, source)?;

        let mut grouped: IndexMap<String, UniqueValue> = IndexMap::new();
        for cell in cells {
            let key = cell.raw.trim();
            if key.is_empty() {
                continue;
            }
            grouped
                .entry(key.to_string())
                .and_modify(|u| u.count += 1)
                .or_insert(UniqueValue {
                    value: key.to_string(),
                    count: 1,
                    correction: cell.correction,
                    skipped: cell.skipped,
                    issue: None,
                });
        }
        let mut unique_values: Vec<UniqueValue> = grouped.into_values().collect();

        let column = session.mappings.get(source);
        let field = column.and_then(|c| validation_field(self.schema, c));

        let (detected, confidence) = match &field {
            Some(f) if f.field_type.is_temporal() => {
                let raws: Vec<&str> = unique_values.iter().map(|u| u.value.as_str()).collect();
                DateFormat::detect(&raws)
                    .map(|(format, confidence)| (Some(format), confidence))
                    .unwrap_or((None, 0.0))
            }
            _ => (None, 0.0),
        };

        let mut issues = Vec::new();
        if let (Some(column), Some(field)) = (column, &field) {
            let validator = validator_for(column, detected);
            for unique in unique_values.iter_mut().filter(|u| !u.skipped) {
                if let Some(cell_issue) = validator.validate(field, unique.effective()) {
                    let issue = ValueIssue {
                        value: unique.value.clone(),
                        message: cell_issue.message,
                        row_count: unique.count,
                        severity: cell_issue.severity,
                        issue_type: cell_issue.issue_type,
                    };
                    issues.push(issue.clone());
                    unique.issue = Some(issue);
                }
            }
        }

        Ok(ColumnAnalysis {
            source: source.to_string(),
            unique_values,
            issues,
            detected_date_format: detected,
            date_format_confidence: confidence,
        })
    }

    /// 分页查询（过滤 → 搜索 → 排序 → 分页）
    pub fn page(&self, session: &ImportSession, source: &str, query: &AnalysisQuery) -> JobResult<AnalysisPage> {
        let analysis = self.analyze(session, source)?;
        Ok(paginate(analysis, query))
    }
}

/// 对已构建的分析结果分页
pub fn paginate(analysis: ColumnAnalysis, query: &AnalysisQuery) -> AnalysisPage {
    let needle = query
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    let mut matched: Vec<(usize, UniqueValue)> = analysis
        .unique_values
        .into_iter()
        .enumerate()
        .filter(|(_, u)| match query.filter {
            ValueFilter::All => true,
            ValueFilter::Modified => u.correction.is_some(),
            ValueFilter::Skipped => u.skipped,
            ValueFilter::Issues => u.issue.is_some(),
        })
        .filter(|(_, u)| {
            needle
                .as_deref()
                .map(|n| u.value.to_lowercase().contains(n))
                .unwrap_or(true)
        })
        .collect();

    matched.sort_by(|(ia, a), (ib, b)| {
        let primary = match query.sort {
            SortField::Value => a
                .value
                .to_lowercase()
                .cmp(&b.value.to_lowercase())
                .then_with(|| a.value.cmp(&b.value)),
            SortField::Count => a.count.cmp(&b.count),
        };
        let primary = match query.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        // 同值按首次出现顺序
        match primary {
            Ordering::Equal => ia.cmp(ib),
            other => other,
        }
    });

    let per_page = query.per_page.max(1);
    let page = query.page.max(1);
    let total_values = matched.len();
    let values = matched
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(|(_, u)| u)
        .collect();

    AnalysisPage {
        source: analysis.source,
        values,
        total_values,
        page,
        per_page,
        issues: analysis.issues,
        detected_date_format: analysis.detected_date_format,
        date_format_confidence: analysis.date_format_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::import::NewSession;
    use crate::domain::mapping::ColumnMappings;
    use crate::domain::types::{IssueSeverity, IssueType};
    use crate::schema::builtin_definition;
    use rusqlite::Connection;
    use std::sync::{Arc, Mutex};

    fn setup(values: &[&str], target: ColumnData) -> (ImportStore, EntitySchema, String) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let store = ImportStore::new(Arc::new(Mutex::new(conn)));
        let session = store
            .create_session(&NewSession {
                team_id: "t1".into(),
                user_id: "u1".into(),
                entity_type: "opportunities".into(),
                original_filename: "deals.csv".into(),
            })
            .unwrap();
        let source = target.source.clone();
        store.set_headers(&session.session_id, &[source.clone()]).unwrap();
        let rows: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut raw = IndexMap::new();
                raw.insert(source.clone(), v.to_string());
                (i as i64 + 2, raw)
            })
            .collect();
        store.append_rows(&session.session_id, &rows).unwrap();
        store
            .set_mappings(&session.session_id, &ColumnMappings::new(vec![target]))
            .unwrap();
        let schema = EntitySchema::build("t1", builtin_definition("opportunities").unwrap(), &[]);
        (store, schema, session.session_id)
    }

    #[test]
    fn test_unique_values_in_first_seen_order() {
        let (store, schema, id) = setup(
            &["Won", "Lost", "won", "Won", "", "Maybe"],
            ColumnData::field("Stage", "stage"),
        );
        let session = store.get_session(&id).unwrap();
        let analysis = ColumnAnalyzer::new(&store, &schema).analyze(&session, "Stage").unwrap();

        let values: Vec<(&str, u64)> = analysis
            .unique_values
            .iter()
            .map(|u| (u.value.as_str(), u.count))
            .collect();
        assert_eq!(values, vec![("Won", 2), ("Lost", 1), ("won", 1), ("Maybe", 1)]);

        // 只有 Maybe 不在选项里
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.issues[0].value, "Maybe");
        assert_eq!(analysis.error_count(), 1);
    }

    #[test]
    fn test_correction_and_skip_clear_issue() {
        let (store, schema, id) = setup(&["12.5", "abc", "abc"], ColumnData::field("Amount", "amount"));
        let analyzer = ColumnAnalyzer::new(&store, &schema);

        let session = store.get_session(&id).unwrap();
        let before = analyzer.analyze(&session, "Amount").unwrap();
        assert_eq!(before.issues.len(), 1);
        assert_eq!(before.issues[0].row_count, 2);

        store.apply_correction(&id, "Amount", "abc", "13").unwrap();
        let after = analyzer.analyze(&session, "Amount").unwrap();
        assert!(after.issues.is_empty());
        assert_eq!(after.unique_values[1].effective(), "13");

        store.apply_correction(&id, "Amount", "abc", "abc").unwrap();
        store.set_skip(&id, "Amount", "abc", true).unwrap();
        let skipped = analyzer.analyze(&session, "Amount").unwrap();
        assert!(skipped.issues.is_empty());
        assert!(skipped.unique_values[1].skipped);
    }

    #[test]
    fn test_date_detection_and_ambiguity() {
        let (store, schema, id) = setup(
            &["31/01/2024", "15/02/2024", "01/02/2024"],
            ColumnData::field("Close", "close_date"),
        );
        let session = store.get_session(&id).unwrap();
        let analysis = ColumnAnalyzer::new(&store, &schema).analyze(&session, "Close").unwrap();

        assert_eq!(analysis.detected_date_format, Some(DateFormat::European));
        assert!(analysis.date_format_confidence > 0.0);
        let ambiguous: Vec<&ValueIssue> = analysis
            .issues
            .iter()
            .filter(|i| i.issue_type == IssueType::Ambiguous)
            .collect();
        assert_eq!(ambiguous.len(), 1);
        assert_eq!(ambiguous[0].value, "01/02/2024");
        assert_eq!(ambiguous[0].severity, IssueSeverity::Warning);
    }

    #[test]
    fn test_page_filter_search_sort() {
        let (store, schema, id) = setup(
            &["beta", "Alpha", "gamma", "alpha2", "beta", "beta"],
            ColumnData::field("Name", "name"),
        );
        store.apply_correction(&id, "Name", "gamma", "Gamma").unwrap();
        let session = store.get_session(&id).unwrap();
        let analyzer = ColumnAnalyzer::new(&store, &schema);

        let mut query = AnalysisQuery::first_page(2);
        let page = analyzer.page(&session, "Name", &query).unwrap();
        let values: Vec<&str> = page.values.iter().map(|u| u.value.as_str()).collect();
        assert_eq!(values, vec!["Alpha", "alpha2"]);
        assert_eq!(page.total_values, 4);
        assert_eq!(page.total_pages(), 2);

        query.sort = SortField::Count;
        query.direction = SortDirection::Desc;
        let page = analyzer.page(&session, "Name", &query).unwrap();
        assert_eq!(page.values[0].value, "beta");
        // 同频次保持首次出现顺序
        assert_eq!(page.values[1].value, "Alpha");

        query.filter = ValueFilter::Modified;
        let page = analyzer.page(&session, "Name", &query).unwrap();
        assert_eq!(page.total_values, 1);
        assert_eq!(page.values[0].value, "gamma");

        let mut search = AnalysisQuery::first_page(10);
        search.search = Some("ALPHA".into());
        assert_eq!(analyzer.page(&session, "Name", &search).unwrap().total_values, 2);
    }

    #[test]
    fn test_page_far_past_end_is_empty() {
        let (store, schema, id) = setup(&["a", "b", "c"], ColumnData::field("Name", "name"));
        let session = store.get_session(&id).unwrap();
        let analyzer = ColumnAnalyzer::new(&store, &schema);

        let mut query = AnalysisQuery::first_page(50);
        query.page = usize::MAX;
        let page = analyzer.page(&session, "Name", &query).unwrap();
        assert!(page.values.is_empty());
        assert_eq!(page.total_values, 3);

        query.page = 0;
        query.per_page = usize::MAX;
        let page = analyzer.page(&session, "Name", &query).unwrap();
        assert_eq!(page.values.len(), 3);
        assert_eq!(page.total_pages(), 1);
    }

    #[test]
    fn test_padded_values_group_with_their_trimmed_form() {
        let (store, schema, id) = setup(
            &[" Acme", "Acme", "Acme  ", "Globex"],
            ColumnData::field("Name", "name"),
        );
        let session = store.get_session(&id).unwrap();
        let analyzer = ColumnAnalyzer::new(&store, &schema);

        let analysis = analyzer.analyze(&session, "Name").unwrap();
        let values: Vec<(&str, u64)> = analysis
            .unique_values
            .iter()
            .map(|u| (u.value.as_str(), u.count))
            .collect();
        assert_eq!(values, vec![("Acme", 3), ("Globex", 1)]);

        // 一次修正覆盖同组的全部行
        assert_eq!(store.apply_correction(&id, "Name", "Acme", "ACME Inc").unwrap(), 3);
        let analysis = analyzer.analyze(&session, "Name").unwrap();
        assert_eq!(analysis.unique_values[0].correction.as_deref(), Some("ACME Inc"));
    }
}
