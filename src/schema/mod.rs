// ==========================================
// CRM 导入引擎 - 实体模式层
// ==========================================
// 职责: 可导入字段 / 可关联关系 的单一来源
// ==========================================

pub mod custom_fields;
pub mod definitions;
pub mod registry;

pub use custom_fields::{CustomFieldDefinition, CustomFieldRepository};
pub use definitions::{builtin_definition, EntityDefinition, ALL_ENTITY_TYPES};
pub use registry::{EntitySchema, MappingIssue, SchemaError, SchemaRegistry, SchemaResult};
