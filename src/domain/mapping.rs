// ==========================================
// CRM 导入引擎 - 列映射值对象
// ==========================================
// 职责: CSV 表头 → 字段 / 关联 的映射描述
// 红线: 值对象不可变，编辑即整体替换（with_* 返回新实例）
// 红线: 只持久化薄描述（source/target/relationship），
//       字段/关联定义在访问时从 SchemaRegistry 联查，绝不序列化联查结果
// ==========================================

use crate::importer::date_format::DateFormat;
use crate::importer::number_format::NumberFormat;
use serde::{Deserialize, Serialize};

// ==========================================
// ColumnData - 单列映射
// ==========================================
// relationship 存在 → 关联映射（target = 匹配器字段）
// relationship 缺失 → 字段映射（target = 字段 key）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnData {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<DateFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<NumberFormat>,
}

impl ColumnData {
    /// 字段映射
    pub fn field(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship: None,
            date_format: None,
            number_format: None,
        }
    }

    /// 关联映射
    ///
    /// # 参数
    /// - source: CSV 表头
    /// - relationship: EntityLink key
    /// - matcher: 匹配器字段（如 id / domain / name）
    pub fn relationship(
        source: impl Into<String>,
        relationship: impl Into<String>,
        matcher: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: matcher.into(),
            relationship: Some(relationship.into()),
            date_format: None,
            number_format: None,
        }
    }

    pub fn is_relationship(&self) -> bool {
        self.relationship.is_some()
    }

    pub fn with_target(&self, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..self.clone()
        }
    }

    pub fn with_date_format(&self, format: Option<DateFormat>) -> Self {
        Self {
            date_format: format,
            ..self.clone()
        }
    }

    pub fn with_number_format(&self, format: Option<NumberFormat>) -> Self {
        Self {
            number_format: format,
            ..self.clone()
        }
    }
}

// ==========================================
// ColumnMappings - 会话映射集合
// ==========================================
// source 唯一；保持用户/自动映射的原始顺序
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMappings(Vec<ColumnData>);

impl ColumnMappings {
    /// 构造映射集合（同一 source 出现多次时保留最后一次）
    pub fn new(columns: Vec<ColumnData>) -> Self {
        let mut out: Vec<ColumnData> = Vec::with_capacity(columns.len());
        for column in columns {
            if let Some(pos) = out.iter().position(|c| c.source == column.source) {
                out[pos] = column;
            } else {
                out.push(column);
            }
        }
        Self(out)
    }

    pub fn as_slice(&self) -> &[ColumnData] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<ColumnData> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, source: &str) -> Option<&ColumnData> {
        self.0.iter().find(|c| c.source == source)
    }

    /// 字段映射列
    pub fn field_columns(&self) -> impl Iterator<Item = &ColumnData> {
        self.0.iter().filter(|c| !c.is_relationship())
    }

    /// 关联映射列
    pub fn relationship_columns(&self) -> impl Iterator<Item = &ColumnData> {
        self.0.iter().filter(|c| c.is_relationship())
    }

    /// 查找映射到指定字段的列
    pub fn column_for_field(&self, field: &str) -> Option<&ColumnData> {
        self.field_columns().find(|c| c.target == field)
    }

    /// 查找映射到指定关联的所有列
    pub fn columns_for_link(&self, link: &str) -> Vec<&ColumnData> {
        self.relationship_columns()
            .filter(|c| c.relationship.as_deref() == Some(link))
            .collect()
    }

    /// 已映射的关联 key（去重，保持首次出现顺序）
    pub fn mapped_links(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for column in self.relationship_columns() {
            if let Some(link) = &column.relationship {
                if !keys.contains(link) {
                    keys.push(link.clone());
                }
            }
        }
        keys
    }

    /// 替换单列映射，返回新集合
    pub fn replace(&self, column: ColumnData) -> Self {
        let mut columns = self.0.clone();
        match columns.iter().position(|c| c.source == column.source) {
            Some(pos) => columns[pos] = column,
            None => columns.push(column),
        }
        Self(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_methods_do_not_mutate_original() {
        let original = ColumnData::field("Signed", "signed_at");
        let changed = original.with_date_format(Some(DateFormat::European));

        assert_eq!(original.date_format, None);
        assert_eq!(changed.date_format, Some(DateFormat::European));
        assert_eq!(changed.source, "Signed");
    }

    #[test]
    fn test_relationship_presence_decides_kind() {
        let field = ColumnData::field("Name", "name");
        let link = ColumnData::relationship("Company", "company", "name");

        assert!(!field.is_relationship());
        assert!(link.is_relationship());
        assert_eq!(link.target, "name");
    }

    #[test]
    fn test_mappings_source_is_unique() {
        let mappings = ColumnMappings::new(vec![
            ColumnData::field("Email", "name"),
            ColumnData::field("Email", "emails"),
        ]);

        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings.get("Email").map(|c| c.target.as_str()), Some("emails"));
    }

    #[test]
    fn test_mapped_links_dedup_in_order() {
        let mappings = ColumnMappings::new(vec![
            ColumnData::relationship("Company Domain", "company", "domain"),
            ColumnData::field("Name", "name"),
            ColumnData::relationship("Company", "company", "name"),
            ColumnData::relationship("Owner", "contact", "email"),
        ]);

        assert_eq!(mappings.mapped_links(), vec!["company", "contact"]);
        assert_eq!(mappings.columns_for_link("company").len(), 2);
    }

    #[test]
    fn test_serialized_form_is_thin() {
        let column = ColumnData::relationship("Company", "company", "name");
        let json = serde_json::to_value(&column).unwrap();

        assert_eq!(json["source"], "Company");
        assert_eq!(json["relationship"], "company");
        assert!(json.get("date_format").is_none());
    }
}
