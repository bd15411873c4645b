// ==========================================
// CRM 导入引擎 - 列数据类型推断
// ==========================================
// 职责: 由值样本推断列的语义类型（email/phone/url/domain/date/datetime）
// 规则: 置信度 = 命中数 / 非空样本数（空值不计入分子分母）
// 规则: 非空样本数不足 min_samples → 不推断；置信度 ≥ 阈值才采纳（恰好等于阈值也采纳）
// ==========================================

use crate::domain::types::FieldType;
use crate::importer::date_format::{DateFormat, DatePattern, TimestampFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

pub const DEFAULT_MIN_SAMPLES: usize = 4;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("valid regex")
});
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?i)(?:https?://|www\.)[a-z0-9\-]+(?:\.[a-z0-9\-]+)+(?::\d+)?(?:[/?#]\S*)?$",
    )
    .expect("valid regex")
});
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(?:[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$").expect("valid regex")
});
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\+|00)?[\d\s().\-/]+(?:\s*(?:x|ext\.?)\s*\d+)?$").expect("valid regex"));

// ==========================================
// 单值判定（供推断与校验复用）
// ==========================================

pub fn looks_like_email(value: &str) -> bool {
    EMAIL_RE.is_match(value.trim())
}

pub fn looks_like_url(value: &str) -> bool {
    URL_RE.is_match(value.trim())
}

pub fn looks_like_domain(value: &str) -> bool {
    let v = value.trim();
    !v.contains('@') && DOMAIN_RE.is_match(v)
}

/// 电话: 允许混合分隔符与可选国家码，数字位数 7..=15，排除日期形态
pub fn looks_like_phone(value: &str) -> bool {
    let v = value.trim();
    if !PHONE_RE.is_match(v) || DatePattern::classify(v).is_some() {
        return false;
    }
    let main = v
        .split(|c: char| c == 'x' || c == 'X' || c == 'e')
        .next()
        .unwrap_or(v);
    let digits = main.chars().filter(char::is_ascii_digit).count();
    (7..=15).contains(&digits)
}

pub fn looks_like_date(value: &str) -> bool {
    let v = value.trim();
    DatePattern::classify(v).is_some() && DateFormat::ALL.iter().any(|f| f.parse(v).is_some())
}

pub fn looks_like_datetime(value: &str) -> bool {
    let v = value.trim();
    v.contains(':')
        && DateFormat::ALL
            .iter()
            .any(|f| TimestampFormat(*f).parse(v).is_some())
}

// ==========================================
// InferenceResult
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub field_type: Option<FieldType>,
    pub confidence: f64,
    /// 建议映射的字段 key（按常见度排序）
    pub suggested_fields: Vec<String>,
    /// 日期列的格式探测结果
    pub date_format: Option<DateFormat>,
}

impl InferenceResult {
    pub fn none() -> Self {
        Self {
            field_type: None,
            confidence: 0.0,
            suggested_fields: Vec::new(),
            date_format: None,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.field_type.is_some()
    }
}

// ==========================================
// DataTypeInferencer
// ==========================================
#[derive(Debug, Clone, Copy)]
pub struct DataTypeInferencer {
    min_samples: usize,
    threshold: f64,
}

impl Default for DataTypeInferencer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLES, DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

/// 候选类型（并列时按此顺序优先）
const CANDIDATES: [FieldType; 6] = [
    FieldType::Email,
    FieldType::Url,
    FieldType::DateTime,
    FieldType::Date,
    FieldType::Phone,
    FieldType::Domain,
];

impl DataTypeInferencer {
    pub fn new(min_samples: usize, threshold: f64) -> Self {
        Self {
            min_samples,
            threshold,
        }
    }

    fn test(field_type: FieldType, value: &str) -> bool {
        match field_type {
            FieldType::Email => looks_like_email(value),
            FieldType::Url => looks_like_url(value),
            FieldType::Domain => looks_like_domain(value),
            FieldType::Phone => looks_like_phone(value),
            FieldType::Date => looks_like_date(value),
            FieldType::DateTime => looks_like_datetime(value),
            _ => false,
        }
    }

    fn suggestions(field_type: FieldType) -> Vec<String> {
        let keys: &[&str] = match field_type {
            FieldType::Email => &["emails", "email"],
            FieldType::Phone => &["phone_numbers", "phone"],
            FieldType::Url => &["website", "linkedin", "url"],
            FieldType::Domain => &["domains", "domain"],
            FieldType::Date => &["date", "due_date", "close_date"],
            FieldType::DateTime => &["due_date", "created_at"],
            _ => &[],
        };
        keys.iter().map(|k| k.to_string()).collect()
    }

    /// 推断列类型
    ///
    /// # 参数
    /// - values: 列值样本（可含空值）
    ///
    /// # 返回
    /// - 未检测到时 field_type = None, confidence = 0
    pub fn infer<S: AsRef<str>>(&self, values: &[S]) -> InferenceResult {
        let non_empty: Vec<&str> = values
            .iter()
            .map(|v| v.as_ref().trim())
            .filter(|v| !v.is_empty())
            .collect();

        if non_empty.len() < self.min_samples {
            debug!(
                samples = non_empty.len(),
                min_samples = self.min_samples,
                "样本不足，跳过类型推断"
            );
            return InferenceResult::none();
        }

        let total = non_empty.len() as f64;
        let mut best: Option<(FieldType, f64)> = None;
        for candidate in CANDIDATES {
            let hits = non_empty
                .iter()
                .filter(|v| Self::test(candidate, v))
                .count();
            let confidence = hits as f64 / total;
            if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                best = Some((candidate, confidence));
            }
        }

        match best {
            Some((field_type, confidence))
                if confidence > 0.0 && confidence + f64::EPSILON >= self.threshold =>
            {
                let date_format = match field_type {
                    FieldType::Date => DateFormat::detect(&non_empty).map(|(f, _)| f),
                    _ => None,
                };
                debug!(?field_type, confidence, "列类型推断完成");
                InferenceResult {
                    field_type: Some(field_type),
                    confidence,
                    suggested_fields: Self::suggestions(field_type),
                    date_format,
                }
            }
            _ => InferenceResult::none(),
        }
    }
}
