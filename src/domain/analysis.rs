// ==========================================
// CRM 导入引擎 - 列分析读模型
// ==========================================
// 职责: 单列唯一值频次表 / 值问题 / 分页查询参数
// 红线: 读模型按需从行存储重建，不单独持久化
// ==========================================

use crate::domain::types::{IssueSeverity, IssueType};
use crate::importer::date_format::DateFormat;
use serde::{Deserialize, Serialize};

// ==========================================
// ValueIssue - 单个唯一值的校验问题
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueIssue {
    pub value: String,
    pub message: String,
    pub row_count: u64,
    pub severity: IssueSeverity,
    pub issue_type: IssueType,
}

// ==========================================
// UniqueValue - 唯一值条目
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueValue {
    pub value: String,             // 原始值
    pub count: u64,                // 出现行数
    pub correction: Option<String>, // 当前修正值
    pub skipped: bool,
    pub issue: Option<ValueIssue>,
}

impl UniqueValue {
    /// 生效值（修正优先）
    pub fn effective(&self) -> &str {
        self.correction.as_deref().unwrap_or(&self.value)
    }
}

// ==========================================
// ColumnAnalysis - 列分析结果
// ==========================================
// unique_values 顺序 = 首次出现顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnAnalysis {
    pub source: String,
    pub unique_values: Vec<UniqueValue>,
    pub issues: Vec<ValueIssue>,
    pub detected_date_format: Option<DateFormat>,
    pub date_format_confidence: f64,
}

impl ColumnAnalysis {
    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count()
    }
}

// ==========================================
// 查询参数
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFilter {
    #[default]
    All,
    Modified, // 已有修正
    Skipped,  // 已跳过
    Issues,   // 有校验问题
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Value,
    Count,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisQuery {
    pub page: usize, // 1 起
    pub per_page: usize,
    pub filter: ValueFilter,
    pub sort: SortField,
    pub direction: SortDirection,
    pub search: Option<String>,
}

impl AnalysisQuery {
    pub fn first_page(per_page: usize) -> Self {
        Self {
            page: 1,
            per_page,
            filter: ValueFilter::All,
            sort: SortField::Value,
            direction: SortDirection::Asc,
            search: None,
        }
    }
}

// ==========================================
// AnalysisPage - 分页结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPage {
    pub source: String,
    pub values: Vec<UniqueValue>,
    pub total_values: usize, // 过滤后的唯一值数量
    pub page: usize,
    pub per_page: usize,
    pub issues: Vec<ValueIssue>,
    pub detected_date_format: Option<DateFormat>,
    pub date_format_confidence: f64,
}

impl AnalysisPage {
    pub fn total_pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total_values.div_ceil(self.per_page)
    }
}
