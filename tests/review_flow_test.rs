// ==========================================
// 审核流程集成测试
// ==========================================
// 覆盖: 修正与撤销 / 多值校验消息 / 跳过 / 分页过滤 / 阶段回退
//       批次运行期间拒绝审核编辑
// ==========================================


use crm_import::domain::{
    AnalysisQuery, BatchKind, ColumnData, SortDirection, SortField, ValueFilter,
};
use crm_import::{ApiError, ImportStatus};
use test_helpers::*;

async fn people_session(api: &crm_import::ImportApi, emails: &[&str]) -> String {
    let rows: Vec<Vec<String>> = emails
        .iter()
        .enumerate()
        .map(|(i, e)| row(&[&format!("Person {}", i + 1), e]))
        .collect();
    let session_id = prepared_session(
        api,
        "people",
        sheet(&["Name", "Email"], &rows),
        vec![
            ColumnData::field("Name", "name"),
            ColumnData::field("Email", "emails"),
        ],
    )
    .await;
    api.begin_review(&session_id).await.unwrap();
    session_id
}

#[tokio::test]
async fn test_correction_then_undo() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["bad-email", "ok@example.com", "bad-email"]).await;

    let affected = api
        .apply_correction(&session_id, "Email", "bad-email", "fixed@example.com")
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let store = &api.context().store;
    let row = store.get_row(&session_id, 2).unwrap();
    assert_eq!(row.value("Email"), Some("fixed@example.com"));
    assert_eq!(row.raw("Email"), Some("bad-email"));
    assert!(row.validation.get("Email").is_none());

    // 修正回原始值 = 撤销
    api.apply_correction(&session_id, "Email", "bad-email", " bad-email ")
        .await
        .unwrap();
    let row = store.get_row(&session_id, 2).unwrap();
    assert!(row.corrections.get("Email").is_none());
    assert_eq!(row.value("Email"), Some("bad-email"));

    let page = api.analyze_column(&session_id, "Email", None).await.unwrap();
    let bad = page.values.iter().find(|v| v.value == "bad-email").unwrap();
    assert_eq!(bad.count, 2);
    assert!(bad.correction.is_none());
    assert!(bad.issue.is_some());
}

#[tokio::test]
async fn test_multi_value_issue_names_only_bad_tokens() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["valid@x.com, not-an-email"]).await;

    let page = api.analyze_column(&session_id, "Email", None).await.unwrap();
    assert_eq!(page.issues.len(), 1);
    let message = &page.issues[0].message;
    assert!(message.contains("not-an-email"));
    assert!(!message.contains("valid@x.com"));
}

#[tokio::test]
async fn test_skip_and_unskip() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["not-an-email", "ok@example.com"]).await;

    assert_eq!(api.skip_value(&session_id, "Email", "not-an-email").await.unwrap(), 1);
    let page = api.analyze_column(&session_id, "Email", None).await.unwrap();
    assert!(page.issues.is_empty());
    let skipped = page.values.iter().find(|v| v.value == "not-an-email").unwrap();
    assert!(skipped.skipped);

    // 重复跳过无影响
    assert_eq!(api.skip_value(&session_id, "Email", "not-an-email").await.unwrap(), 0);

    assert_eq!(api.unskip_value(&session_id, "Email", "not-an-email").await.unwrap(), 1);
    let page = api.analyze_column(&session_id, "Email", None).await.unwrap();
    assert_eq!(page.issues.len(), 1);
}

#[tokio::test]
async fn test_analysis_paging_and_filters() {
    let (api, _) = build_api().await;
    let session_id = people_session(
        &api,
        &[
            "a@example.com",
            "b@example.com",
            "b@example.com",
            "c@example.com",
            "broken",
            "",
        ],
    )
    .await;

    let mut query = AnalysisQuery::first_page(2);
    let page = api
        .analyze_column(&session_id, "Email", Some(query.clone()))
        .await
        .unwrap();
    // 空白值不进入唯一值表
    assert_eq!(page.total_values, 4);
    assert_eq!(page.total_pages(), 2);
    assert_eq!(page.values.len(), 2);

    query.page = 2;
    let page = api
        .analyze_column(&session_id, "Email", Some(query.clone()))
        .await
        .unwrap();
    assert_eq!(page.values.len(), 2);

    let mut by_count = AnalysisQuery::first_page(10);
    by_count.sort = SortField::Count;
    by_count.direction = SortDirection::Desc;
    let page = api
        .analyze_column(&session_id, "Email", Some(by_count))
        .await
        .unwrap();
    assert_eq!(page.values[0].value, "b@example.com");
    assert_eq!(page.values[0].count, 2);

    let mut issues_only = AnalysisQuery::first_page(10);
    issues_only.filter = ValueFilter::Issues;
    let page = api
        .analyze_column(&session_id, "Email", Some(issues_only))
        .await
        .unwrap();
    assert_eq!(page.total_values, 1);
    assert_eq!(page.values[0].value, "broken");

    let mut search = AnalysisQuery::first_page(10);
    search.search = Some("EXAMPLE".to_string());
    let page = api
        .analyze_column(&session_id, "Email", Some(search))
        .await
        .unwrap();
    assert_eq!(page.total_values, 3);
}

#[tokio::test]
async fn test_go_back_to_mapping_allows_remap() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["a@example.com"]).await;

    // 审核阶段不能直接改映射
    let err = api
        .set_mappings(&session_id, vec![ColumnData::field("Name", "name")])
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BusinessRuleViolation(_)));

    api.go_back(&session_id, ImportStatus::Mapping).await.unwrap();
    api.set_mappings(&session_id, vec![ColumnData::field("Name", "name")])
        .await
        .unwrap();
    assert_eq!(api.get_mappings(&session_id).await.unwrap().len(), 1);

    let session = api.get_session(&session_id).await.unwrap();
    assert_eq!(session.status, ImportStatus::Mapping);
}

#[tokio::test]
async fn test_corrections_rejected_after_completion() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["a@example.com"]).await;
    api.start_execution(&session_id).await.unwrap();
    api.wait_for_execution(&session_id).await.unwrap();

    let err = api
        .apply_correction(&session_id, "Email", "a@example.com", "b@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BusinessRuleViolation(_)));
}

#[tokio::test]
async fn test_edits_rejected_while_batch_active() {
    let (api, _) = build_api().await;
    let session_id = people_session(&api, &["bad-email", "ok@example.com"]).await;

    let store = &api.context().store;
    let batch_id = store
        .begin_batch(
            &session_id,
            BatchKind::ValidateColumn,
            2,
            chrono::Duration::seconds(300),
        )
        .unwrap();

    let err = api
        .apply_correction(&session_id, "Email", "bad-email", "fixed@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BatchInProgress { .. }));
    let err = api
        .skip_value(&session_id, "Email", "bad-email")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BatchInProgress { .. }));
    assert!(store.get_row(&session_id, 2).unwrap().corrections.is_empty());

    store.finish_batch(&session_id, &batch_id).unwrap();
    assert_eq!(
        api.apply_correction(&session_id, "Email", "bad-email", "fixed@example.com")
            .await
            .unwrap(),
        1
    );
}
