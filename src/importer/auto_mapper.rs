// ==========================================
// CRM 导入引擎 - 自动列映射
// ==========================================
// 职责: 上传后生成初始 ColumnData 列表
// 顺序: 字段别名 → 关联匹配器别名 → 值样本类型推断
// 红线: 一个表头只映射一次；一个字段只被映射一次
// ==========================================

use crate::domain::entity_link::{EntityLink, MatchableField};
use crate::domain::mapping::{ColumnData, ColumnMappings};
use crate::importer::column_matcher::ColumnMatcher;
use crate::importer::data_type_inferencer::DataTypeInferencer;
use crate::importer::date_format::DateFormat;
use crate::importer::file_parser::ParsedSheet;
use crate::schema::EntitySchema;
use std::collections::HashMap;
use tracing::debug;

/// 推断与格式探测的样本行数
pub const DEFAULT_SAMPLE_SIZE: usize = 50;

pub struct AutoMapper {
    inferencer: DataTypeInferencer,
    sample_size: usize,
}

impl Default for AutoMapper {
    fn default() -> Self {
        Self::new(DataTypeInferencer::default(), DEFAULT_SAMPLE_SIZE)
    }
}

impl AutoMapper {
    pub fn new(inferencer: DataTypeInferencer, sample_size: usize) -> Self {
        Self {
            inferencer,
            sample_size,
        }
    }

    /// 生成初始映射
    ///
    /// # 参数
    /// - schema: 团队实体模式
    /// - sheet: 已解析的表头与行
    ///
    /// # 返回
    /// - 按表头顺序排列的映射（未命中的表头不出现）
    pub fn map(&self, schema: &EntitySchema, sheet: &ParsedSheet) -> ColumnMappings {
        let mut by_header: HashMap<String, ColumnData> = HashMap::new();
        let mut mapped_fields: Vec<String> = Vec::new();

        // 1. 字段别名
        for field in &schema.fields {
            let free = unmapped(&sheet.headers, &by_header);
            if let Some(header) = ColumnMatcher::find_matching_header(&free, &field.guesses) {
                let mut column = ColumnData::field(header, &field.key);
                if field.field_type.is_temporal() {
                    column = column.with_date_format(self.detect_date_format(sheet, header));
                }
                by_header.insert(header.to_string(), column);
                mapped_fields.push(field.key.clone());
            }
        }

        // 2. 关联匹配器别名（每个匹配器最多一列）
        for link in &schema.links {
            for matcher in &link.matchable_fields {
                let free = unmapped(&sheet.headers, &by_header);
                let guesses = matcher_guesses(link, matcher);
                if let Some(header) = ColumnMatcher::find_matching_header(&free, &guesses) {
                    by_header.insert(
                        header.to_string(),
                        ColumnData::relationship(header, &link.key, &matcher.field),
                    );
                }
            }
        }

        // 3. 值样本推断（仅当恰有一个未映射字段符合建议时）
        for header in unmapped(&sheet.headers, &by_header) {
            let sample = sheet.column_sample(&header, self.sample_size);
            let inference = self.inferencer.infer(&sample);
            let Some(field_type) = inference.field_type else {
                continue;
            };

            let candidates: Vec<&str> = schema
                .fields
                .iter()
                .filter(|f| f.field_type == field_type || inference.suggested_fields.contains(&f.key))
                .filter(|f| schema.is_writable(&f.key) && !mapped_fields.contains(&f.key))
                .map(|f| f.key.as_str())
                .collect();

            if let [only] = candidates.as_slice() {
                debug!(header = %header, field = only, confidence = inference.confidence, "按值样本推断映射");
                let column = ColumnData::field(header.clone(), *only).with_date_format(inference.date_format);
                mapped_fields.push(only.to_string());
                by_header.insert(header, column);
            }
        }

        let columns = sheet
            .headers
            .iter()
            .filter_map(|h| by_header.remove(h))
            .collect();
        ColumnMappings::new(columns)
    }

    fn detect_date_format(&self, sheet: &ParsedSheet, header: &str) -> Option<DateFormat> {
        let sample = sheet.column_sample(header, self.sample_size);
        DateFormat::detect(&sample).map(|(format, _)| format)
    }
}

fn unmapped(headers: &[String], by_header: &HashMap<String, ColumnData>) -> Vec<String> {
    headers
        .iter()
        .filter(|h| !by_header.contains_key(*h))
        .cloned()
        .collect()
}

/// 匹配器别名: 显式别名 + "<关联>_<匹配器>"；最低优先级匹配器继承关联别名
fn matcher_guesses(link: &EntityLink, matcher: &MatchableField) -> Vec<String> {
    let mut guesses = matcher.guesses.clone();
    guesses.push(format!("{}_{}", link.key, matcher.field));
    guesses.push(format!("{} {}", link.label, matcher.label));

    let is_last = link
        .matchable_fields
        .last()
        .map(|m| m.field == matcher.field)
        .unwrap_or(false);
    if is_last {
        guesses.extend(link.guesses.iter().cloned());
    }
    guesses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definitions::builtin_definition;

    fn schema(entity_type: &str) -> EntitySchema {
        EntitySchema::build("t1", builtin_definition(entity_type).unwrap(), &[])
    }

    fn sheet(headers: &[&str], rows: &[&[&str]]) -> ParsedSheet {
        ParsedSheet::from_raw(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn test_maps_fields_and_relationships() {
        let s = sheet(
            &["Full Name", "E-mail", "Company", "Company Domain"],
            &[&["Ada", "ada@x.com", "Acme", "acme.com"]],
        );
        let mappings = AutoMapper::default().map(&schema("people"), &s);

        assert_eq!(mappings.get("Full Name").map(|c| c.target.as_str()), Some("name"));
        assert_eq!(mappings.get("E-mail").map(|c| c.target.as_str()), Some("emails"));

        let company = mappings.get("Company").unwrap();
        assert_eq!(company.relationship.as_deref(), Some("company"));
        assert_eq!(company.target, "name");

        let domain = mappings.get("Company Domain").unwrap();
        assert_eq!(domain.relationship.as_deref(), Some("company"));
        assert_eq!(domain.target, "domain");
    }

    #[test]
    fn test_header_order_is_preserved_and_unique() {
        let s = sheet(&["Email", "Name", "Email Address"], &[]);
        let mappings = AutoMapper::default().map(&schema("people"), &s);

        let sources: Vec<&str> = mappings.as_slice().iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["Email", "Name"]);
    }

    #[test]
    fn test_infers_unmapped_email_column() {
        let s = sheet(
            &["Name", "Contact Point"],
            &[
                &["A", "a@x.com"],
                &["B", "b@x.com"],
                &["C", "c@y.org"],
                &["D", "d@z.io"],
            ],
        );
        let mappings = AutoMapper::default().map(&schema("people"), &s);
        assert_eq!(mappings.get("Contact Point").map(|c| c.target.as_str()), Some("emails"));
    }

    #[test]
    fn test_date_column_gets_detected_format() {
        let s = sheet(
            &["Name", "Close Date"],
            &[&["Deal", "31/01/2024"], &["Deal 2", "15/02/2024"]],
        );
        let mappings = AutoMapper::default().map(&schema("opportunities"), &s);
        let close = mappings.get("Close Date").unwrap();
        assert_eq!(close.target, "close_date");
        assert_eq!(close.date_format, Some(DateFormat::European));
    }
}
