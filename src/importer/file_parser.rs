// ==========================================
// CRM 导入引擎 - 表头/行提取
// ==========================================
// 支持: Excel (.xlsx) / CSV (.csv)
// 职责: 只提取表头与行文本，不做类型转换
// 红线: 行号 = 数据行下标 + 2（表头为第 1 行）
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use calamine::{open_workbook, Reader, Xlsx};
use csv::ReaderBuilder;
use indexmap::IndexMap;
use std::fs::File;
use std::path::Path;

// ==========================================
// ParsedSheet - 解析结果
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>, // 已按表头宽度补齐/截断
}

impl ParsedSheet {
    /// 由表头与原始行构造（规范化表头，丢弃空行，对齐宽度）
    pub fn from_raw(raw_headers: Vec<String>, raw_rows: Vec<Vec<String>>) -> Self {
        let headers = normalize_headers(raw_headers);
        let width = headers.len();

        let rows = raw_rows
            .into_iter()
            .map(|row| {
                let mut cells: Vec<String> =
                    row.into_iter().map(|c| c.trim().to_string()).collect();
                cells.resize(width, String::new());
                cells
            })
            .filter(|cells| cells.iter().any(|c| !c.is_empty()))
            .collect();

        Self { headers, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// 转为 (行号, 表头 → 值) 列表
    pub fn keyed_rows(&self) -> Vec<(i64, IndexMap<String, String>)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, cells)| {
                let map = self
                    .headers
                    .iter()
                    .cloned()
                    .zip(cells.iter().cloned())
                    .collect();
                (idx as i64 + 2, map)
            })
            .collect()
    }

    /// 某列的值样本
    pub fn column_sample(&self, header: &str, limit: usize) -> Vec<String> {
        let Some(idx) = self.headers.iter().position(|h| h == header) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(idx))
            .filter(|v| !v.is_empty())
            .take(limit)
            .cloned()
            .collect()
    }
}

/// 表头规范化: 去空白；空表头 → "Column N"；重复表头 → "X (2)"
fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for (idx, header) in raw.into_iter().enumerate() {
        let trimmed = header.trim();
        let base = if trimmed.is_empty() {
            format!("Column {}", idx + 1)
        } else {
            trimmed.to_string()
        };

        let mut candidate = base.clone();
        let mut n = 2;
        while out.contains(&candidate) {
            candidate = format!("{} ({})", base, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

fn check_exists(path: &Path) -> ImportResult<()> {
    if !path.exists() {
        return Err(ImportError::FileNotFound(path.display().to_string()));
    }
    Ok(())
}

// ==========================================
// CSV
// ==========================================
pub struct CsvParser;

impl CsvParser {
    pub fn parse(&self, path: &Path) -> ImportResult<ParsedSheet> {
        check_exists(path)?;
        let file = File::open(path)?;
        self.parse_reader(file)
    }

    /// 从任意 reader 解析（测试与内存数据使用）
    pub fn parse_reader<R: std::io::Read>(&self, reader: R) -> ImportResult<ParsedSheet> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true) // 允许行长度不一致
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(ImportError::MissingHeader);
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(ParsedSheet::from_raw(headers, rows))
    }
}

// ==========================================
// Excel（读取第一个工作表）
// ==========================================
pub struct ExcelParser;

impl ExcelParser {
    pub fn parse(&self, path: &Path) -> ImportResult<ParsedSheet> {
        check_exists(path)?;

        let mut workbook: Xlsx<_> = open_workbook(path)
            .map_err(|e: calamine::XlsxError| ImportError::ExcelParseError(e.to_string()))?;

        let sheet_names = workbook.sheet_names();
        let sheet_name = sheet_names
            .first()
            .cloned()
            .ok_or_else(|| ImportError::ExcelParseError("Excel 文件无工作表".to_string()))?;

        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| ImportError::ExcelParseError(e.to_string()))?;

        let mut rows = range.rows();
        let headers: Vec<String> = rows
            .next()
            .ok_or(ImportError::MissingHeader)?
            .iter()
            .map(|cell| cell.to_string())
            .collect();

        let data: Vec<Vec<String>> = rows
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();

        Ok(ParsedSheet::from_raw(headers, data))
    }
}

// ==========================================
// 通用入口（按扩展名选择）
// ==========================================
pub struct UniversalFileParser;

impl UniversalFileParser {
    pub fn parse<P: AsRef<Path>>(&self, file_path: P) -> ImportResult<ParsedSheet> {
        let path = file_path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "csv" => CsvParser.parse(path),
            "xlsx" => ExcelParser.parse(path),
            _ => Err(ImportError::UnsupportedFormat(ext)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_csv_parser_valid_file() {
        let mut temp_file: NamedTempFile = tempfile::Builder::new()
            .suffix(".csv")
            .tempfile()
            .unwrap();
        writeln!(temp_file, "Name, Email ,Company").unwrap();
        writeln!(temp_file, "Ada Lovelace,ada@example.com,Analytical").unwrap();
        writeln!(temp_file, "Grace Hopper,grace@example.com,Navy").unwrap();

        let sheet = UniversalFileParser.parse(temp_file.path()).unwrap();

        assert_eq!(sheet.headers, vec!["Name", "Email", "Company"]);
        assert_eq!(sheet.row_count(), 2);
        assert_eq!(sheet.rows[0][1], "ada@example.com");
    }

    #[test]
    fn test_csv_parser_file_not_found() {
        let result = CsvParser.parse(Path::new("non_existent.csv"));
        assert!(matches!(result, Err(ImportError::FileNotFound(_))));
    }

    #[test]
    fn test_blank_rows_dropped_and_width_aligned() {
        let data = "Name,Email\nAda,ada@example.com\n,\nGrace\nLin,lin@example.com,extra\n";
        let sheet = CsvParser.parse_reader(data.as_bytes()).unwrap();

        assert_eq!(sheet.row_count(), 3);
        assert_eq!(sheet.rows[1], vec!["Grace".to_string(), String::new()]);
        assert_eq!(sheet.rows[2].len(), 2);
    }

    #[test]
    fn test_duplicate_and_blank_headers_get_suffix() {
        let data = "Email,,Email\na@x.com,1,b@x.com\n";
        let sheet = CsvParser.parse_reader(data.as_bytes()).unwrap();

        assert_eq!(sheet.headers, vec!["Email", "Column 2", "Email (2)"]);
    }

    #[test]
    fn test_keyed_rows_are_header_adjusted() {
        let data = "Name\nAda\nGrace\n";
        let sheet = CsvParser.parse_reader(data.as_bytes()).unwrap();
        let keyed = sheet.keyed_rows();

        assert_eq!(keyed[0].0, 2);
        assert_eq!(keyed[1].0, 3);
        assert_eq!(keyed[1].1.get("Name").map(String::as_str), Some("Grace"));
    }

    #[test]
    fn test_unsupported_extension() {
        let result = UniversalFileParser.parse("contacts.pdf");
        assert!(matches!(result, Err(ImportError::UnsupportedFormat(_))));
    }
}
