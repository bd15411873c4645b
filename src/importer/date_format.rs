// ==========================================
// CRM 导入引擎 - 日期/时间戳格式
// ==========================================
// 职责: 日期字符串解析 / 规范化输出 / 歧义判定 / 列格式探测
// 格式: ISO (YYYY-MM-DD) / EUROPEAN (日在前) / AMERICAN (月在前)
// 红线: 解析顺序固定: 数字斜杠形式优先于自然语言月份形式
// 红线: TimestampFormat 对 EUROPEAN/AMERICAN 时间在日期之前，ISO 时间在日期之后
// ==========================================

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// 两位年份的世纪基准
const TWO_DIGIT_YEAR_PIVOT: i32 = 2000;

static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$").expect("valid regex")
});
static NUMERIC_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{4}|\d{2})$").expect("valid regex")
});
static LEADING_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}:\d{2}(?::\d{2})?(?:\s*[AaPp][Mm])?)\s+(.+)$").expect("valid regex")
});
static TRAILING_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(.+?)[\sT]+(\d{1,2}:\d{2}(?::\d{2})?(?:\.\d+)?(?:\s*[AaPp][Mm])?)(?:Z|[+-]\d{2}:?\d{2})?$",
    )
    .expect("valid regex")
});
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?(?:\.\d+)?\s*([AaPp][Mm])?$").expect("valid regex")
});

/// 自然语言月份形式（月份名大小写不敏感，全称/缩写均可）
const NATURAL_PATTERNS: &[&str] = &[
    "%d %B %Y",
    "%d %B, %Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d-%b-%Y",
    "%a, %d %B %Y",
    "%A, %B %d, %Y",
];

// ==========================================
// DatePattern - 单值的字面形态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePattern {
    Iso,                             // YYYY-MM-DD
    Numeric { first: u32, second: u32 }, // NN/NN/YYYY（或 - .）
    Natural,                         // 月份名
}

impl DatePattern {
    /// 识别日期字面形态（不校验日历合法性）
    pub fn classify(value: &str) -> Option<Self> {
        let v = value.trim();
        if ISO_DATE_RE.is_match(v) {
            return Some(DatePattern::Iso);
        }
        if let Some(caps) = NUMERIC_DATE_RE.captures(v) {
            let first = caps[1].parse().ok()?;
            let second = caps[2].parse().ok()?;
            return Some(DatePattern::Numeric { first, second });
        }
        if parse_natural(v).is_some() {
            return Some(DatePattern::Natural);
        }
        None
    }
}

fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    if raw.len() == 2 {
        Some(TWO_DIGIT_YEAR_PIVOT + year)
    } else {
        Some(year)
    }
}

fn parse_iso(value: &str) -> Option<NaiveDate> {
    let caps = ISO_DATE_RE.captures(value)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_natural(value: &str) -> Option<NaiveDate> {
    NATURAL_PATTERNS
        .iter()
        .find_map(|pattern| NaiveDate::parse_from_str(value, pattern).ok())
}

// ==========================================
// DateFormat
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DateFormat {
    #[default]
    Iso,
    European,
    American,
}

impl DateFormat {
    pub const ALL: [DateFormat; 3] = [DateFormat::Iso, DateFormat::European, DateFormat::American];

    pub fn as_str(&self) -> &'static str {
        match self {
            DateFormat::Iso => "ISO",
            DateFormat::European => "EUROPEAN",
            DateFormat::American => "AMERICAN",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ISO" => Some(DateFormat::Iso),
            "EUROPEAN" | "EU" => Some(DateFormat::European),
            "AMERICAN" | "US" => Some(DateFormat::American),
            _ => None,
        }
    }

    /// 规范输出模式
    pub fn pattern(&self) -> &'static str {
        match self {
            DateFormat::Iso => "%Y-%m-%d",
            DateFormat::European => "%d/%m/%Y",
            DateFormat::American => "%m/%d/%Y",
        }
    }

    /// 界面示例
    pub fn example(&self) -> &'static str {
        match self {
            DateFormat::Iso => "2024-01-31",
            DateFormat::European => "31/01/2024",
            DateFormat::American => "01/31/2024",
        }
    }

    /// 数字形式中 (日, 月) 所在的段
    fn day_month(&self, first: u32, second: u32) -> Option<(u32, u32)> {
        match self {
            DateFormat::Iso => None,
            DateFormat::European => Some((first, second)),
            DateFormat::American => Some((second, first)),
        }
    }

    fn parse_numeric(&self, value: &str) -> Option<NaiveDate> {
        let caps = NUMERIC_DATE_RE.captures(value)?;
        let first = caps[1].parse().ok()?;
        let second = caps[2].parse().ok()?;
        let year = expand_year(&caps[3])?;
        let (day, month) = self.day_month(first, second)?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// 解析日期
    ///
    /// # 顺序
    /// - ISO: ISO 数字形式 → 自然语言形式
    /// - EUROPEAN/AMERICAN: 本格式数字形式 → 自然语言形式 → ISO 数字形式
    pub fn parse(&self, value: &str) -> Option<NaiveDate> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }
        match self {
            DateFormat::Iso => parse_iso(v).or_else(|| parse_natural(v)),
            DateFormat::European | DateFormat::American => self
                .parse_numeric(v)
                .or_else(|| parse_natural(v))
                .or_else(|| parse_iso(v)),
        }
    }

    /// 规范输出
    pub fn format(&self, date: NaiveDate) -> String {
        date.format(self.pattern()).to_string()
    }

    /// 是否歧义: 两段数字形式且前两段均 ≤ 12
    pub fn is_ambiguous(&self, value: &str) -> bool {
        if *self == DateFormat::Iso {
            return false;
        }
        matches!(
            DatePattern::classify(value),
            Some(DatePattern::Numeric { first, second }) if first <= 12 && second <= 12
        )
    }

    /// 本格式要求的"日"段是否 > 12（即值只能按本格式读取）
    pub fn is_unambiguous_for(&self, value: &str) -> bool {
        match (self, DatePattern::classify(value)) {
            (DateFormat::Iso, Some(DatePattern::Iso)) => true,
            (DateFormat::Iso, _) => false,
            (_, Some(DatePattern::Numeric { first, second })) => self
                .day_month(first, second)
                .map(|(day, month)| day > 12 && day <= 31 && month <= 12)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// 按样本探测列日期格式
    ///
    /// # 返回
    /// - Some((format, confidence)): confidence = 按该格式可解析的非空值占比
    /// - None: 样本中没有可识别的日期
    ///
    /// # 规则
    /// - 可解析数最多者胜；并列时以"仅本格式可读"的证据数决胜
    /// - 只有歧义值、无任何证据时取 AMERICAN，置信度减半
    pub fn detect<S: AsRef<str>>(values: &[S]) -> Option<(DateFormat, f64)> {
        let non_empty: Vec<&str> = values
            .iter()
            .map(|v| v.as_ref().trim())
            .filter(|v| !v.is_empty())
            .collect();
        if non_empty.is_empty() {
            return None;
        }

        let mut ambiguous = 0usize;
        let mut scores: Vec<(DateFormat, usize, usize)> = Vec::with_capacity(3);
        for format in DateFormat::ALL {
            let parsed = non_empty.iter().filter(|v| format.parse(v).is_some()).count();
            let evidence = non_empty
                .iter()
                .filter(|v| format.is_unambiguous_for(v))
                .count();
            scores.push((format, parsed, evidence));
        }
        for v in &non_empty {
            if DateFormat::European.is_ambiguous(v) {
                ambiguous += 1;
            }
        }

        let (best, parsed, evidence) = scores
            .iter()
            .copied()
            .max_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)).then(b.0.rank().cmp(&a.0.rank())))?;
        if parsed == 0 {
            return None;
        }

        let total = non_empty.len() as f64;
        let confidence = parsed as f64 / total;

        if evidence == 0 && ambiguous > 0 {
            return Some((DateFormat::American, confidence * 0.5));
        }
        Some((best, confidence))
    }

    /// 并列时的偏好顺序（小者优先）
    fn rank(&self) -> u8 {
        match self {
            DateFormat::Iso => 0,
            DateFormat::American => 1,
            DateFormat::European => 2,
        }
    }
}

impl fmt::Display for DateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// TimestampFormat - 日期 + 时间
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampFormat(pub DateFormat);

impl TimestampFormat {
    pub fn date_format(&self) -> DateFormat {
        self.0
    }

    /// 规范输出模式
    pub fn pattern(&self) -> &'static str {
        match self.0 {
            DateFormat::Iso => "%Y-%m-%d %H:%M:%S",
            DateFormat::European => "%H:%M %d/%m/%Y",
            DateFormat::American => "%H:%M %m/%d/%Y",
        }
    }

    pub fn format(&self, value: NaiveDateTime) -> String {
        value.format(self.pattern()).to_string()
    }

    /// 解析时间戳（时间在前或在后均可；仅日期时取 00:00）
    pub fn parse(&self, value: &str) -> Option<NaiveDateTime> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }

        if let Some(caps) = LEADING_TIME_RE.captures(v) {
            if let (Some(time), Some(date)) = (parse_time(&caps[1]), self.0.parse(&caps[2])) {
                return Some(date.and_time(time));
            }
        }
        if let Some(caps) = TRAILING_TIME_RE.captures(v) {
            if let (Some(date), Some(time)) = (self.0.parse(&caps[1]), parse_time(&caps[2])) {
                return Some(date.and_time(time));
            }
        }
        self.0.parse(v).and_then(|date| date.and_hms_opt(0, 0, 0))
    }

    /// 日期部分是否歧义
    pub fn is_ambiguous(&self, value: &str) -> bool {
        let v = value.trim();
        let date_part = LEADING_TIME_RE
            .captures(v)
            .map(|c| c[2].to_string())
            .or_else(|| TRAILING_TIME_RE.captures(v).map(|c| c[1].to_string()))
            .unwrap_or_else(|| v.to_string());
        self.0.is_ambiguous(&date_part)
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    let caps = TIME_RE.captures(value.trim())?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let second: u32 = caps
        .get(3)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(0))?;

    if let Some(meridiem) = caps.get(4) {
        if hour == 0 || hour > 12 {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("pm");
        hour = match (pm, hour) {
            (false, 12) => 0,
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, h) => h,
        };
    }
    NaiveTime::from_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_european_ambiguity() {
        assert!(DateFormat::European.is_ambiguous("01/02/2024"));
        assert!(!DateFormat::European.is_ambiguous("31/01/2024"));
        assert!(DateFormat::American.is_ambiguous("01/02/2024"));
        assert!(!DateFormat::Iso.is_ambiguous("01/02/2024"));
        assert!(DateFormat::European.is_ambiguous("05-05-2024"));
        assert!(!DateFormat::European.is_ambiguous("2024-01-02"));
    }

    #[test]
    fn test_unambiguous_for_requires_day_segment_over_12() {
        assert!(DateFormat::European.is_unambiguous_for("31/01/2024"));
        assert!(!DateFormat::American.is_unambiguous_for("31/01/2024"));
        assert!(DateFormat::American.is_unambiguous_for("01/31/2024"));
        assert!(!DateFormat::European.is_unambiguous_for("01/02/2024"));
    }

    #[test]
    fn test_parse_by_format() {
        assert_eq!(DateFormat::European.parse("01/02/2024"), Some(ymd(2024, 2, 1)));
        assert_eq!(DateFormat::American.parse("01/02/2024"), Some(ymd(2024, 1, 2)));
        assert_eq!(DateFormat::Iso.parse("2024-02-01"), Some(ymd(2024, 2, 1)));
        assert_eq!(DateFormat::Iso.parse("01/02/2024"), None);
        assert_eq!(DateFormat::American.parse("31/01/2024"), None);
    }

    #[test]
    fn test_two_digit_year_pivot() {
        assert_eq!(DateFormat::European.parse("15.03.24"), Some(ymd(2024, 3, 15)));
        assert_eq!(DateFormat::American.parse("3-15-99"), Some(ymd(2099, 3, 15)));
    }

    #[test]
    fn test_natural_language_and_iso_fallback() {
        assert_eq!(DateFormat::European.parse("15 January 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(DateFormat::American.parse("Jan 15, 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(DateFormat::Iso.parse("15-Jan-2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(DateFormat::European.parse("2024-01-15"), Some(ymd(2024, 1, 15)));
        assert_eq!(DateFormat::European.parse("not a date"), None);
    }

    #[test]
    fn test_format_canonical() {
        let date = ymd(2024, 1, 31);
        assert_eq!(DateFormat::Iso.format(date), "2024-01-31");
        assert_eq!(DateFormat::European.format(date), "31/01/2024");
        assert_eq!(DateFormat::American.format(date), "01/31/2024");
    }

    #[test]
    fn test_detect_prefers_evidence() {
        let eu = ["31/01/2024", "01/02/2024", "15/03/2024", ""];
        let (format, confidence) = DateFormat::detect(&eu).unwrap();
        assert_eq!(format, DateFormat::European);
        assert!((confidence - 1.0).abs() < f64::EPSILON);

        let iso = ["2024-01-31", "2024-02-01"];
        assert_eq!(DateFormat::detect(&iso).map(|d| d.0), Some(DateFormat::Iso));

        let ambiguous = ["01/02/2024", "03/04/2024"];
        let (format, confidence) = DateFormat::detect(&ambiguous).unwrap();
        assert_eq!(format, DateFormat::American);
        assert!(confidence < 1.0);

        let none: [&str; 2] = ["hello", "world"];
        assert_eq!(DateFormat::detect(&none), None);
    }

    #[test]
    fn test_timestamp_time_placement() {
        let ts = ymd(2024, 1, 31).and_hms_opt(14, 30, 0).unwrap();
        assert_eq!(TimestampFormat(DateFormat::Iso).format(ts), "2024-01-31 14:30:00");
        assert_eq!(TimestampFormat(DateFormat::European).format(ts), "14:30 31/01/2024");
        assert_eq!(TimestampFormat(DateFormat::American).format(ts), "14:30 01/31/2024");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = ymd(2024, 1, 31).and_hms_opt(9, 5, 0).unwrap();
        for format in DateFormat::ALL {
            let tf = TimestampFormat(format);
            assert_eq!(tf.parse(&tf.format(ts)), Some(ts), "format={format}");
        }
    }

    #[test]
    fn test_timestamp_accepts_either_order() {
        let tf = TimestampFormat(DateFormat::European);
        let expected = ymd(2024, 2, 1).and_hms_opt(18, 0, 0).unwrap();
        assert_eq!(tf.parse("01/02/2024 6:00 PM"), Some(expected));
        assert_eq!(tf.parse("18:00 01/02/2024"), Some(expected));
        assert_eq!(
            TimestampFormat(DateFormat::Iso).parse("2024-02-01T18:00:00Z"),
            Some(expected)
        );
        assert!(tf.is_ambiguous("18:00 01/02/2024"));
        assert!(!tf.is_ambiguous("18:00 31/01/2024"));
    }
}
