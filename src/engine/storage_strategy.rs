// ==========================================
// CRM 导入引擎 - 关联存储策略
// ==========================================
// 职责: 按 EntityLink.storage_type 把已解析的目标 id 写入行写入计划
// - ForeignKey: 保存前写外键列（单值，取首个）
// - MorphToMany: 保存后 attach（多值）
// - CustomFieldValue: 保存后写 record 类型自定义字段值（单值）
// 红线: 执行器只面向 StorageStrategy，不区分具体存储方式
// ==========================================

use crate::domain::entity_link::EntityLink;
use crate::domain::record::RecordLink;
use crate::domain::types::StorageType;
use crate::engine::error::{JobError, JobResult};
use crate::repository::RowWritePlan;
use serde_json::Value;

pub trait StorageStrategy: Send + Sync {
    /// 是否接受多个目标
    fn is_multi(&self) -> bool;

    /// 将目标 id 写入计划
    ///
    /// # 参数
    /// - target_ids: 已去重、按解析顺序排列的目标 id（非空）
    fn attach(&self, link: &EntityLink, plan: &mut RowWritePlan, target_ids: &[String]) -> JobResult<()>;
}

pub struct ForeignKeyStorage;

impl StorageStrategy for ForeignKeyStorage {
    fn is_multi(&self) -> bool {
        false
    }

    fn attach(&self, link: &EntityLink, plan: &mut RowWritePlan, target_ids: &[String]) -> JobResult<()> {
        let column = link.foreign_key.as_deref().ok_or_else(|| JobError::RelationshipError {
            relationship: link.key.clone(),
            message: "外键关联缺少 foreign_key 列".to_string(),
        })?;
        if let Some(id) = target_ids.first() {
            plan.record
                .fields
                .insert(column.to_string(), Value::String(id.clone()));
        }
        Ok(())
    }
}

pub struct MorphToManyStorage;

impl StorageStrategy for MorphToManyStorage {
    fn is_multi(&self) -> bool {
        true
    }

    fn attach(&self, link: &EntityLink, plan: &mut RowWritePlan, target_ids: &[String]) -> JobResult<()> {
        for id in target_ids {
            let exists = plan
                .links
                .iter()
                .any(|l| l.relationship == link.key && &l.target_id == id);
            if !exists {
                plan.links.push(RecordLink {
                    owner_id: plan.record.id.clone(),
                    relationship: link.key.clone(),
                    target_id: id.clone(),
                });
            }
        }
        Ok(())
    }
}

pub struct CustomFieldValueStorage;

impl StorageStrategy for CustomFieldValueStorage {
    fn is_multi(&self) -> bool {
        false
    }

    fn attach(&self, link: &EntityLink, plan: &mut RowWritePlan, target_ids: &[String]) -> JobResult<()> {
        if let Some(id) = target_ids.first() {
            plan.custom_values.retain(|(code, _)| code != &link.key);
            plan.custom_values.push((link.key.clone(), id.clone()));
        }
        Ok(())
    }
}

/// 按存储类型选择策略
pub fn strategy_for(storage_type: StorageType) -> &'static dyn StorageStrategy {
    match storage_type {
        StorageType::ForeignKey => &ForeignKeyStorage,
        StorageType::MorphToMany => &MorphToManyStorage,
        StorageType::CustomFieldValue => &CustomFieldValueStorage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::Record;
    use crate::domain::types::LinkSource;

    fn plan() -> RowWritePlan {
        RowWritePlan::new(Record::new_import("t1", "tasks", "u1"), false)
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_foreign_key_sets_column_with_first_id() {
        let link = EntityLink::new("company", "Company", LinkSource::Relationship, "companies", StorageType::ForeignKey)
            .foreign_key("company_id");
        let mut plan = plan();
        strategy_for(link.storage_type)
            .attach(&link, &mut plan, &ids(&["c1", "c2"]))
            .unwrap();

        assert_eq!(plan.record.get_str("company_id"), Some("c1"));
        assert!(plan.links.is_empty());
    }

    #[test]
    fn test_foreign_key_without_column_is_error() {
        let link = EntityLink::new("company", "Company", LinkSource::Relationship, "companies", StorageType::ForeignKey);
        let mut plan = plan();
        let err = ForeignKeyStorage.attach(&link, &mut plan, &ids(&["c1"])).unwrap_err();
        assert!(matches!(err, JobError::RelationshipError { .. }));
    }

    #[test]
    fn test_morph_attaches_all_once() {
        let link = EntityLink::new("people", "People", LinkSource::Relationship, "people", StorageType::MorphToMany);
        let mut plan = plan();
        let strategy = strategy_for(link.storage_type);
        assert!(strategy.is_multi());

        strategy.attach(&link, &mut plan, &ids(&["p1", "p2"])).unwrap();
        strategy.attach(&link, &mut plan, &ids(&["p2"])).unwrap();

        let targets: Vec<&str> = plan.links.iter().map(|l| l.target_id.as_str()).collect();
        assert_eq!(targets, vec!["p1", "p2"]);
        assert!(plan.links.iter().all(|l| l.owner_id == plan.record.id));
    }

    #[test]
    fn test_custom_field_value_replaces_previous() {
        let link = EntityLink::new("referrer", "Referrer", LinkSource::CustomField, "people", StorageType::CustomFieldValue);
        let mut plan = plan();
        let strategy = strategy_for(link.storage_type);
        strategy.attach(&link, &mut plan, &ids(&["p1"])).unwrap();
        strategy.attach(&link, &mut plan, &ids(&["p9"])).unwrap();

        assert_eq!(plan.custom_values, vec![("referrer".to_string(), "p9".to_string())]);
    }
}
