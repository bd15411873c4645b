// ==========================================
// CRM 导入引擎 - 数值格式
// ==========================================
// POINT: 1,234.56 （千分位逗号，小数点）
// COMMA: 1.234,56 （千分位点，小数逗号）
// ==========================================

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static POINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?$").expect("valid regex")
});
static COMMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d{1,3}(?:\.\d{3})+|\d+)(?:,\d+)?$").expect("valid regex")
});

/// 数值前后允许出现的修饰符号
const DECORATIONS: &[char] = &['$', '€', '£', '¥', '%'];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumberFormat {
    #[default]
    Point,
    Comma,
}

impl NumberFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberFormat::Point => "POINT",
            NumberFormat::Comma => "COMMA",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "POINT" => Some(NumberFormat::Point),
            "COMMA" => Some(NumberFormat::Comma),
            _ => None,
        }
    }

    fn separators(&self) -> (char, char) {
        // (千分位, 小数点)
        match self {
            NumberFormat::Point => (',', '.'),
            NumberFormat::Comma => ('.', ','),
        }
    }

    /// 去掉空白（含不换行空格）与货币/百分号
    fn strip(value: &str) -> String {
        value
            .trim()
            .trim_matches(|c| DECORATIONS.contains(&c))
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
            .collect()
    }

    /// 解析数值
    pub fn parse(&self, value: &str) -> Option<f64> {
        let cleaned = Self::strip(value);
        if cleaned.is_empty() {
            return None;
        }
        let valid = match self {
            NumberFormat::Point => POINT_RE.is_match(&cleaned),
            NumberFormat::Comma => COMMA_RE.is_match(&cleaned),
        };
        if !valid {
            return None;
        }

        let (thousands, decimal) = self.separators();
        let canonical: String = cleaned
            .chars()
            .filter(|c| *c != thousands)
            .map(|c| if c == decimal { '.' } else { c })
            .collect();
        canonical.parse::<f64>().ok().filter(|n| n.is_finite())
    }

    /// 格式化输出（整数部分按千分位分组）
    pub fn format(&self, value: f64) -> String {
        let (thousands, decimal) = self.separators();
        let raw = format!("{}", value.abs());
        let (int_part, frac_part) = match raw.split_once('.') {
            Some((i, f)) => (i.to_string(), Some(f.to_string())),
            None => (raw.clone(), None),
        };

        let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
        for (idx, ch) in int_part.chars().enumerate() {
            if idx > 0 && (int_part.len() - idx) % 3 == 0 {
                grouped.push(thousands);
            }
            grouped.push(ch);
        }

        let mut out = String::new();
        if value.is_sign_negative() && value != 0.0 {
            out.push('-');
        }
        out.push_str(&grouped);
        if let Some(frac) = frac_part {
            out.push(decimal);
            out.push_str(&frac);
        }
        out
    }
}

impl fmt::Display for NumberFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
