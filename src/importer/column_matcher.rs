// ==========================================
// CRM 导入引擎 - 表头匹配器
// ==========================================
// 职责: 表头规范化 + 别名匹配（单复数、分隔符不敏感）
// 红线: 多个表头命中时按表头输入顺序取第一个，绝不随机
// ==========================================

use regex::Regex;
use std::sync::LazyLock;

static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-.]+").expect("valid regex"));
static UNDERSCORE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").expect("valid regex"));

pub struct ColumnMatcher;

impl ColumnMatcher {
    /// 规范化表头
    ///
    /// 小写；`-` / `.` / 连续空白 → `_`；折叠重复 `_`；去首尾空白与 `_`
    pub fn normalize(value: &str) -> String {
        let lowered = value.trim().to_lowercase();
        let replaced = SEPARATOR_RE.replace_all(&lowered, "_");
        let collapsed = UNDERSCORE_RE.replace_all(&replaced, "_");
        collapsed.trim_matches('_').to_string()
    }

    /// 单复数折叠后的候选形式（含自身）
    fn forms(normalized: &str) -> Vec<String> {
        let mut forms = vec![normalized.to_string()];
        if normalized.len() > 3 && normalized.ends_with("es") {
            forms.push(normalized[..normalized.len() - 2].to_string());
        }
        if normalized.len() > 2 && normalized.ends_with('s') && !normalized.ends_with("ss") {
            forms.push(normalized[..normalized.len() - 1].to_string());
        }
        forms
    }

    /// 两个已规范化的字符串是否视为同一名称
    fn same_name(left: &[String], right: &[String]) -> bool {
        left.iter().any(|l| right.contains(l))
    }

    /// 单个表头是否命中任一别名
    pub fn matches(header: &str, guesses: &[String]) -> bool {
        let header_forms = Self::forms(&Self::normalize(header));
        guesses
            .iter()
            .map(|g| Self::forms(&Self::normalize(g)))
            .any(|guess_forms| Self::same_name(&header_forms, &guess_forms))
    }

    /// 在表头列表中查找第一个命中任一别名的表头
    ///
    /// # 参数
    /// - headers: CSV 表头（输入顺序）
    /// - guesses: 别名列表
    ///
    /// # 返回
    /// - Some(header): 第一个命中的表头（表头顺序优先，而非别名顺序）
    /// - None: 无命中
    pub fn find_matching_header<'a>(headers: &'a [String], guesses: &[String]) -> Option<&'a str> {
        let guess_forms: Vec<Vec<String>> = guesses
            .iter()
            .map(|g| Self::normalize(g))
            .filter(|g| !g.is_empty())
            .map(|g| Self::forms(&g))
            .collect();

        headers
            .iter()
            .find(|header| {
                let normalized = Self::normalize(header);
                if normalized.is_empty() {
                    return false;
                }
                let header_forms = Self::forms(&normalized);
                guess_forms
                    .iter()
                    .any(|forms| Self::same_name(&header_forms, forms))
            })
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_normalize_separators() {
        assert_eq!(ColumnMatcher::normalize("Company Name"), "company_name");
        assert_eq!(ColumnMatcher::normalize("  E-Mail.Address "), "e_mail_address");
        assert_eq!(ColumnMatcher::normalize("first__name"), "first_name");
        assert_eq!(ColumnMatcher::normalize("phone   number"), "phone_number");
        assert_eq!(ColumnMatcher::normalize("_id_"), "id");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for value in [
            "Company Name",
            "  E-Mail.Address ",
            "__weird -- header..",
            "ÜBER Größe",
            "",
            "a_b_c",
        ] {
            let once = ColumnMatcher::normalize(value);
            assert_eq!(ColumnMatcher::normalize(&once), once, "value={value:?}");
        }
    }

    #[test]
    fn test_find_matching_header_basic() {
        let headers = strings(&["Company Name"]);
        let guesses = strings(&["company_name"]);
        assert_eq!(
            ColumnMatcher::find_matching_header(&headers, &guesses),
            Some("Company Name")
        );
    }

    #[test]
    fn test_plural_fold_both_ways() {
        let headers = strings(&["Emails"]);
        assert_eq!(
            ColumnMatcher::find_matching_header(&headers, &strings(&["email"])),
            Some("Emails")
        );

        let headers = strings(&["Address"]);
        assert_eq!(
            ColumnMatcher::find_matching_header(&headers, &strings(&["addresses"])),
            Some("Address")
        );
    }

    #[test]
    fn test_header_order_wins() {
        let headers = strings(&["Work Email", "Email", "Emails"]);
        let guesses = strings(&["emails", "email"]);
        assert_eq!(
            ColumnMatcher::find_matching_header(&headers, &guesses),
            Some("Email")
        );
    }

    #[test]
    fn test_no_false_positive() {
        let headers = strings(&["Status", "Notes", "Phone"]);
        assert_eq!(
            ColumnMatcher::find_matching_header(&headers, &strings(&["name", "stat"])),
            None
        );
        assert!(!ColumnMatcher::matches("Class", &strings(&["cla"])));
    }
}
