// ==========================================
// CRM 导入引擎 - 内建实体定义
// ==========================================
// 职责: companies / people / opportunities / tasks / notes 的字段与关联声明
// 说明: emails / domains / phone_numbers 等为系统自定义字段（custom=true），
//       存于 custom_fields；其中 unique 字段可作为主匹配字段
// ==========================================

use crate::domain::entity_link::{EntityLink, ImportField, MatchableField};
use crate::domain::types::{FieldType, LinkSource, StorageType};

pub const COMPANIES: &str = "companies";
pub const PEOPLE: &str = "people";
pub const OPPORTUNITIES: &str = "opportunities";
pub const TASKS: &str = "tasks";
pub const NOTES: &str = "notes";

pub const ALL_ENTITY_TYPES: [&str; 5] = [COMPANIES, PEOPLE, OPPORTUNITIES, TASKS, NOTES];

/// 内建实体定义（不含团队自定义字段）
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    pub entity_type: &'static str,
    pub label: &'static str,
    pub name_field: &'static str, // 自动新建关联记录时写入名称的字段
    pub fields: Vec<ImportField>,
    pub links: Vec<EntityLink>,
}

/// 记录 ID 字段（仅用于匹配，不写入）
pub fn id_field() -> ImportField {
    ImportField::new("id", "Record ID", FieldType::Text).with_guesses(&["record_id", "uuid"])
}

/// 目标实体的标准匹配器
pub fn matchers_for_target(target_entity: &str) -> Vec<MatchableField> {
    match target_entity {
        COMPANIES => vec![
            MatchableField::id().with_guesses(&["company_id"]),
            MatchableField::domain().with_guesses(&["company_domain", "company_website", "website"]),
            MatchableField::name().with_guesses(&["company", "company_name", "organization", "account"]),
        ],
        PEOPLE => vec![
            MatchableField::id().with_guesses(&["person_id", "contact_id"]),
            MatchableField::email().with_guesses(&["contact_email", "person_email"]),
            MatchableField::phone().with_guesses(&["contact_phone"]),
            MatchableField::name().with_guesses(&["contact", "contact_name", "person"]),
        ],
        _ => vec![MatchableField::id(), MatchableField::name()],
    }
}

fn link(
    key: &str,
    label: &str,
    target: &str,
    storage: StorageType,
    guesses: &[&str],
) -> EntityLink {
    let mut link = EntityLink::new(key, label, LinkSource::Relationship, target, storage)
        .with_guesses(guesses);
    for matcher in matchers_for_target(target) {
        link = link.matcher(matcher);
    }
    link
}

fn morph_links() -> Vec<EntityLink> {
    vec![
        link("companies", "Companies", COMPANIES, StorageType::MorphToMany, &["company"]),
        link("people", "People", PEOPLE, StorageType::MorphToMany, &["person", "contacts"]),
        link(
            "opportunities",
            "Opportunities",
            OPPORTUNITIES,
            StorageType::MorphToMany,
            &["opportunity", "deal", "deals"],
        ),
    ]
}

fn companies() -> EntityDefinition {
    EntityDefinition {
        entity_type: COMPANIES,
        label: "Companies",
        name_field: "name",
        fields: vec![
            id_field(),
            ImportField::new("name", "Name", FieldType::Text)
                .required()
                .with_guesses(&["company", "company_name", "organization", "account_name"]),
            ImportField::new("domains", "Domains", FieldType::Domain)
                .custom()
                .unique()
                .multi_value()
                .with_guesses(&["domain", "website", "url", "company_domain"]),
            ImportField::new("linkedin", "LinkedIn", FieldType::Url)
                .custom()
                .with_guesses(&["linkedin_url", "linkedin_profile"]),
            ImportField::new("employee_count", "Employees", FieldType::Number)
                .custom()
                .with_guesses(&["employee_count", "headcount", "size"]),
            ImportField::new("icp", "ICP", FieldType::Choice)
                .custom()
                .with_options(&["Yes", "No"])
                .with_guesses(&["ideal_customer"]),
        ],
        links: vec![],
    }
}

fn people() -> EntityDefinition {
    EntityDefinition {
        entity_type: PEOPLE,
        label: "People",
        name_field: "name",
        fields: vec![
            id_field(),
            ImportField::new("name", "Name", FieldType::Text)
                .required()
                .with_guesses(&["full_name", "contact_name", "person"]),
            ImportField::new("emails", "Emails", FieldType::Email)
                .custom()
                .unique()
                .multi_value()
                .with_guesses(&["email", "email_address", "e_mail", "work_email"]),
            ImportField::new("phone_numbers", "Phone Numbers", FieldType::Phone)
                .custom()
                .multi_value()
                .with_guesses(&["phone", "phone_number", "mobile", "telephone"]),
            ImportField::new("job_title", "Job Title", FieldType::Text)
                .custom()
                .with_guesses(&["title", "position", "role"]),
            ImportField::new("linkedin", "LinkedIn", FieldType::Url)
                .custom()
                .with_guesses(&["linkedin_url", "linkedin_profile"]),
        ],
        links: vec![link(
            "company",
            "Company",
            COMPANIES,
            StorageType::ForeignKey,
            &["company", "company_name", "organization", "account"],
        )
        .foreign_key("company_id")],
    }
}

fn opportunities() -> EntityDefinition {
    EntityDefinition {
        entity_type: OPPORTUNITIES,
        label: "Opportunities",
        name_field: "name",
        fields: vec![
            id_field(),
            ImportField::new("name", "Name", FieldType::Text)
                .required()
                .with_guesses(&["opportunity", "opportunity_name", "deal", "deal_name"]),
            ImportField::new("amount", "Amount", FieldType::Number)
                .custom()
                .with_guesses(&["value", "deal_value", "revenue"]),
            ImportField::new("stage", "Stage", FieldType::Choice)
                .custom()
                .with_options(&["Prospecting", "Qualification", "Proposal", "Negotiation", "Won", "Lost"])
                .with_guesses(&["deal_stage", "pipeline_stage"]),
            ImportField::new("close_date", "Close Date", FieldType::Date)
                .custom()
                .with_guesses(&["expected_close", "close", "closing_date"]),
        ],
        links: vec![
            link(
                "company",
                "Company",
                COMPANIES,
                StorageType::ForeignKey,
                &["company", "company_name", "account"],
            )
            .foreign_key("company_id"),
            link(
                "contact",
                "Contact",
                PEOPLE,
                StorageType::ForeignKey,
                &["contact", "contact_name", "point_of_contact"],
            )
            .foreign_key("contact_id"),
        ],
    }
}

fn tasks() -> EntityDefinition {
    EntityDefinition {
        entity_type: TASKS,
        label: "Tasks",
        name_field: "title",
        fields: vec![
            id_field(),
            ImportField::new("title", "Title", FieldType::Text)
                .required()
                .with_guesses(&["task", "task_name", "subject", "name"]),
            ImportField::new("description", "Description", FieldType::Text)
                .custom()
                .with_guesses(&["details", "body"]),
            ImportField::new("due_date", "Due Date", FieldType::DateTime)
                .custom()
                .with_guesses(&["due", "deadline", "due_at"]),
            ImportField::new("status", "Status", FieldType::Choice)
                .custom()
                .with_options(&["To do", "In progress", "Done"]),
            ImportField::new("priority", "Priority", FieldType::Choice)
                .custom()
                .with_options(&["Low", "Medium", "High"]),
        ],
        links: morph_links(),
    }
}

fn notes() -> EntityDefinition {
    EntityDefinition {
        entity_type: NOTES,
        label: "Notes",
        name_field: "title",
        fields: vec![
            id_field(),
            ImportField::new("title", "Title", FieldType::Text)
                .required()
                .with_guesses(&["subject", "name"]),
            ImportField::new("body", "Body", FieldType::Text)
                .custom()
                .with_guesses(&["note", "content", "text"]),
        ],
        links: morph_links(),
    }
}

/// 按实体类型取内建定义
pub fn builtin_definition(entity_type: &str) -> Option<EntityDefinition> {
    match entity_type {
        COMPANIES => Some(companies()),
        PEOPLE => Some(people()),
        OPPORTUNITIES => Some(opportunities()),
        TASKS => Some(tasks()),
        NOTES => Some(notes()),
        _ => None,
    }
}
