// ==========================================
// CRM 导入引擎 - 导入层
// ==========================================
// 职责: 纯逻辑部分（表头匹配、类型推断、日期/数值格式、值校验、自动映射）
//       以及表头/行提取
// 红线: 不访问数据库
// ==========================================

pub mod auto_mapper;
pub mod column_matcher;
pub mod data_type_inferencer;
pub mod date_format;
pub mod error;
pub mod file_parser;
pub mod number_format;
pub mod value_validator;

// 重导出核心类型
pub use auto_mapper::AutoMapper;
pub use column_matcher::ColumnMatcher;
pub use data_type_inferencer::{DataTypeInferencer, InferenceResult};
pub use date_format::{DateFormat, TimestampFormat};
pub use error::{ImportError, ImportResult};
pub use file_parser::{CsvParser, ExcelParser, ParsedSheet, UniversalFileParser};
pub use number_format::NumberFormat;
pub use value_validator::{DateValidator, TimestampValidator, ValueValidator};
