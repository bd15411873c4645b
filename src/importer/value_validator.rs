// ==========================================
// CRM 导入引擎 - 值校验器
// ==========================================
// 职责: 单值校验，产出带类型的问题（error / warning）
// 红线: 空值/空白值永远合法
// 红线: 校验问题不阻断流水线，仅供审核展示
// 红线: 多值字段逐个 token 校验，返回 token → 错误 的映射，而非单一聚合错误
// ==========================================

use crate::domain::entity_link::ImportField;
use crate::domain::import::CellIssue;
use crate::domain::types::{FieldType, IssueSeverity, IssueType};
use crate::i18n::t_with_args;
use crate::importer::data_type_inferencer::{
    looks_like_domain, looks_like_email, looks_like_phone, looks_like_url,
};
use crate::importer::date_format::{DateFormat, TimestampFormat};
use crate::importer::number_format::NumberFormat;
use std::collections::BTreeMap;

/// 多值分隔符
pub const MULTI_VALUE_SEPARATOR: char = ',';

/// 拆分多值（去空白，丢弃空 token）
pub fn split_tokens(value: &str) -> Vec<&str> {
    value
        .split(MULTI_VALUE_SEPARATOR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

fn error(issue_type: IssueType, message: String) -> CellIssue {
    CellIssue {
        message,
        severity: IssueSeverity::Error,
        issue_type,
    }
}

fn warning(issue_type: IssueType, message: String) -> CellIssue {
    CellIssue {
        message,
        severity: IssueSeverity::Warning,
        issue_type,
    }
}

/// 去掉协议 / www. / 路径，得到裸域名（小写）
pub fn normalize_domain(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let without_www = without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme);
    without_www
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_www)
        .trim_end_matches('.')
        .to_string()
}

// ==========================================
// DateValidator
// ==========================================
pub struct DateValidator;

impl DateValidator {
    /// 按所选格式校验日期
    ///
    /// # 返回
    /// - None: 合法且无歧义
    /// - Warning/Ambiguous: 可解析但前两段均 ≤ 12
    /// - Error/FormatMismatch: 所选格式不可解析，但其他格式可以
    /// - Error/Invalid: 任何格式都不可解析
    pub fn validate(value: &str, format: DateFormat) -> Option<CellIssue> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }
        if format.parse(v).is_some() {
            if format.is_ambiguous(v) {
                return Some(warning(
                    IssueType::Ambiguous,
                    t_with_args(
                        "validation.ambiguous_date",
                        &[("value", v), ("format", format.example())],
                    ),
                ));
            }
            return None;
        }

        if let Some(other) = DateFormat::ALL
            .iter()
            .find(|f| **f != format && f.parse(v).is_some())
        {
            return Some(error(
                IssueType::FormatMismatch,
                t_with_args(
                    "validation.date_format_mismatch",
                    &[("value", v), ("format", other.as_str())],
                ),
            ));
        }

        Some(error(
            IssueType::Invalid,
            t_with_args(
                "validation.invalid_date",
                &[("value", v), ("format", format.example())],
            ),
        ))
    }
}

// ==========================================
// TimestampValidator
// ==========================================
pub struct TimestampValidator;

impl TimestampValidator {
    pub fn validate(value: &str, format: DateFormat) -> Option<CellIssue> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }
        let timestamp = TimestampFormat(format);
        if timestamp.parse(v).is_some() {
            if timestamp.is_ambiguous(v) {
                return Some(warning(
                    IssueType::Ambiguous,
                    t_with_args(
                        "validation.ambiguous_date",
                        &[("value", v), ("format", format.example())],
                    ),
                ));
            }
            return None;
        }

        if let Some(other) = DateFormat::ALL
            .iter()
            .find(|f| **f != format && TimestampFormat(**f).parse(v).is_some())
        {
            return Some(error(
                IssueType::FormatMismatch,
                t_with_args(
                    "validation.date_format_mismatch",
                    &[("value", v), ("format", other.as_str())],
                ),
            ));
        }

        Some(error(
            IssueType::Invalid,
            t_with_args(
                "validation.invalid_timestamp",
                &[("value", v), ("format", format.example())],
            ),
        ))
    }
}

// ==========================================
// ValueValidator
// ==========================================
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueValidator {
    pub date_format: DateFormat,
    pub number_format: NumberFormat,
}

impl ValueValidator {
    pub fn new(date_format: DateFormat, number_format: NumberFormat) -> Self {
        Self {
            date_format,
            number_format,
        }
    }

    /// 校验单值
    ///
    /// # 参数
    /// - field: 目标字段（类型 / 选项 / 是否多值）
    /// - value: 生效值（修正值优先）
    ///
    /// # 返回
    /// - None: 合法（含空值）
    /// - Some(issue): 多值字段时 message 列出所有非法 token
    pub fn validate(&self, field: &ImportField, value: &str) -> Option<CellIssue> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }

        if field.multi_value {
            let errors = self.validate_tokens(field, v);
            if errors.is_empty() {
                return None;
            }
            let bad: Vec<&str> = errors.keys().map(String::as_str).collect();
            return Some(error(
                IssueType::Invalid,
                t_with_args(
                    "validation.invalid_tokens",
                    &[("field", field.label.as_str()), ("values", bad.join(", ").as_str())],
                ),
            ));
        }

        self.validate_single(field, v)
    }

    /// 多值字段逐 token 校验
    ///
    /// # 返回
    /// - token → 错误消息（只包含非法 token）
    pub fn validate_tokens(&self, field: &ImportField, value: &str) -> BTreeMap<String, String> {
        split_tokens(value)
            .into_iter()
            .filter_map(|token| {
                self.validate_single(field, token)
                    .filter(|issue| issue.severity == IssueSeverity::Error)
                    .map(|issue| (token.to_string(), issue.message))
            })
            .collect()
    }

    fn validate_single(&self, field: &ImportField, v: &str) -> Option<CellIssue> {
        match field.field_type {
            FieldType::Text | FieldType::Record => None,
            FieldType::Email => (!looks_like_email(v)).then(|| {
                error(
                    IssueType::Invalid,
                    t_with_args("validation.invalid_email", &[("value", v)]),
                )
            }),
            FieldType::Phone => (!looks_like_phone(v)).then(|| {
                error(
                    IssueType::Invalid,
                    t_with_args("validation.invalid_phone", &[("value", v)]),
                )
            }),
            FieldType::Url => (!looks_like_url(v) && !looks_like_domain(v)).then(|| {
                error(
                    IssueType::Invalid,
                    t_with_args("validation.invalid_url", &[("value", v)]),
                )
            }),
            FieldType::Domain => (!looks_like_domain(&normalize_domain(v))).then(|| {
                error(
                    IssueType::Invalid,
                    t_with_args("validation.invalid_domain", &[("value", v)]),
                )
            }),
            FieldType::Date => DateValidator::validate(v, self.date_format),
            FieldType::DateTime => TimestampValidator::validate(v, self.date_format),
            FieldType::Number => self.validate_number(v),
            FieldType::Choice | FieldType::MultiChoice => self.validate_choice(field, v),
        }
    }

    fn validate_number(&self, v: &str) -> Option<CellIssue> {
        if self.number_format.parse(v).is_some() {
            return None;
        }
        let other = match self.number_format {
            NumberFormat::Point => NumberFormat::Comma,
            NumberFormat::Comma => NumberFormat::Point,
        };
        if other.parse(v).is_some() {
            return Some(error(
                IssueType::FormatMismatch,
                t_with_args(
                    "validation.number_format_mismatch",
                    &[("value", v), ("format", other.as_str())],
                ),
            ));
        }
        Some(error(
            IssueType::Invalid,
            t_with_args("validation.invalid_number", &[("value", v)]),
        ))
    }

    /// 选项匹配（大小写不敏感；未声明选项时不校验）
    fn validate_choice(&self, field: &ImportField, v: &str) -> Option<CellIssue> {
        if field.options.is_empty() || field.find_option(v).is_some() {
            return None;
        }
        Some(error(
            IssueType::Invalid,
            t_with_args(
                "validation.invalid_choice",
                &[("value", v), ("options", field.options.join(", ").as_str())],
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emails_field() -> ImportField {
        ImportField::new("emails", "Emails", FieldType::Email).multi_value()
    }

    #[test]
    fn test_blank_is_always_valid() {
        let validator = ValueValidator::default();
        for field_type in [
            FieldType::Email,
            FieldType::Phone,
            FieldType::Date,
            FieldType::Number,
            FieldType::Choice,
        ] {
            let field = ImportField::new("f", "F", field_type).with_options(&["A"]);
            assert_eq!(validator.validate(&field, ""), None);
            assert_eq!(validator.validate(&field, "   "), None);
        }
    }

    #[test]
    fn test_multi_value_errors_only_bad_tokens() {
        let validator = ValueValidator::default();
        let errors = validator.validate_tokens(&emails_field(), "valid@x.com, not-an-email");

        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("not-an-email"));

        let issue = validator
            .validate(&emails_field(), "valid@x.com, not-an-email")
            .unwrap();
        assert_eq!(issue.severity, IssueSeverity::Error);
        assert!(issue.message.contains("not-an-email"));
        assert!(!issue.message.contains("valid@x.com"));
    }

    #[test]
    fn test_multi_choice_case_insensitive() {
        let validator = ValueValidator::default();
        let field = ImportField::new("tags", "Tags", FieldType::MultiChoice)
            .with_options(&["Lead", "Customer", "Partner"]);

        assert_eq!(validator.validate(&field, "lead, CUSTOMER"), None);
        let errors = validator.validate_tokens(&field, "lead, vendor, partner");
        assert_eq!(errors.keys().collect::<Vec<_>>(), vec!["vendor"]);

        let payment = ImportField::new("payment", "Payment", FieldType::Choice)
            .with_options(&["Überweisung", "Bar"]);
        assert_eq!(validator.validate(&payment, "überweisung"), None);
    }

    #[test]
    fn test_date_ambiguous_is_warning() {
        let validator = ValueValidator::new(DateFormat::European, NumberFormat::Point);
        let field = ImportField::new("close_date", "Close Date", FieldType::Date);

        let issue = validator.validate(&field, "01/02/2024").unwrap();
        assert_eq!(issue.severity, IssueSeverity::Warning);
        assert_eq!(issue.issue_type, IssueType::Ambiguous);

        assert_eq!(validator.validate(&field, "31/01/2024"), None);
    }

    #[test]
    fn test_date_format_mismatch_and_invalid() {
        let validator = ValueValidator::new(DateFormat::American, NumberFormat::Point);
        let field = ImportField::new("close_date", "Close Date", FieldType::Date);

        let mismatch = validator.validate(&field, "31/01/2024").unwrap();
        assert_eq!(mismatch.issue_type, IssueType::FormatMismatch);

        let invalid = validator.validate(&field, "someday").unwrap();
        assert_eq!(invalid.issue_type, IssueType::Invalid);
        assert_eq!(invalid.severity, IssueSeverity::Error);
    }

    #[test]
    fn test_timestamp_validator() {
        assert_eq!(
            TimestampValidator::validate("2024-01-31 10:00:00", DateFormat::Iso),
            None
        );
        let issue = TimestampValidator::validate("10:00 02/03/2024", DateFormat::European).unwrap();
        assert_eq!(issue.issue_type, IssueType::Ambiguous);
    }

    #[test]
    fn test_number_locale() {
        let point = ValueValidator::new(DateFormat::Iso, NumberFormat::Point);
        let comma = ValueValidator::new(DateFormat::Iso, NumberFormat::Comma);
        let field = ImportField::new("amount", "Amount", FieldType::Number);

        assert_eq!(point.validate(&field, "1,234.50"), None);
        assert_eq!(comma.validate(&field, "1.234,50"), None);
        assert_eq!(
            point.validate(&field, "1.234,50").map(|i| i.issue_type),
            Some(IssueType::FormatMismatch)
        );
        assert_eq!(
            point.validate(&field, "twelve").map(|i| i.issue_type),
            Some(IssueType::Invalid)
        );
    }

    #[test]
    fn test_domain_normalisation() {
        assert_eq!(normalize_domain("https://www.Acme.com/about"), "acme.com");
        assert_eq!(normalize_domain("acme.com."), "acme.com");

        let validator = ValueValidator::default();
        let field = ImportField::new("domains", "Domains", FieldType::Domain);
        assert_eq!(validator.validate(&field, "https://www.acme.com"), None);
        assert!(validator.validate(&field, "not a domain").is_some());
    }
}
