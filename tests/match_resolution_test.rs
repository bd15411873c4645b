// ==========================================
// 行匹配集成测试
// ==========================================
// 覆盖: id 匹配 / 空主列新建 / 多值邮箱归一匹配 / 重复解析幂等
// ==========================================


use crm_import::domain::{ColumnData, ImportRow};
use crm_import::MatchAction;
use serde_json::json;
use test_helpers::*;

async fn rows_of(api: &crm_import::ImportApi, session_id: &str) -> Vec<ImportRow> {
    api.context().store.rows_page(session_id, 0, 100).unwrap()
}

#[tokio::test]
async fn test_id_column_matching() {
    let (api, _) = build_api().await;
    let existing = seed_record(&api, "companies", &[("name", json!("Acme"))]);

    let session_id = prepared_session(
        &api,
        "companies",
        sheet(
            &["ID", "Name"],
            &[
                row(&[&existing.id, "Acme"]),
                row(&["no-such-id", "Ghost"]),
                row(&["", "Fresh"]),
            ],
        ),
        vec![ColumnData::field("ID", "id"), ColumnData::field("Name", "name")],
    )
    .await;
    api.begin_review(&session_id).await.unwrap();

    assert_eq!(api.resolve_matches(&session_id).await.unwrap(), 3);

    let rows = rows_of(&api, &session_id).await;
    assert_eq!(rows[0].match_action, Some(MatchAction::Update));
    assert_eq!(rows[0].matched_id.as_deref(), Some(existing.id.as_str()));
    assert_eq!(rows[1].match_action, Some(MatchAction::Skip));
    assert_eq!(rows[1].matched_id, None);
    assert_eq!(rows[2].match_action, Some(MatchAction::Create));
    assert_eq!(rows[2].matched_id, None);

    let preview = api.preview(&session_id).await.unwrap();
    assert_eq!(
        (preview.create_count, preview.update_count, preview.skip_count),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_email_matching_is_normalised() {
    let (api, _) = build_api().await;
    let existing = seed_record(
        &api,
        "people",
        &[("name", json!("Alice")), ("emails", json!(["alice@example.com"]))],
    );

    let session_id = prepared_session(
        &api,
        "people",
        sheet(
            &["Name", "Email"],
            &[
                row(&["Alice", " other@x.com, ALICE@Example.com "]),
                row(&["Bob", "bob@example.com"]),
            ],
        ),
        vec![
            ColumnData::field("Name", "name"),
            ColumnData::field("Email", "emails"),
        ],
    )
    .await;
    api.begin_review(&session_id).await.unwrap();
    api.resolve_matches(&session_id).await.unwrap();

    let rows = rows_of(&api, &session_id).await;
    assert_eq!(rows[0].matched_id.as_deref(), Some(existing.id.as_str()));
    assert_eq!(rows[1].match_action, Some(MatchAction::Create));
}

#[tokio::test]
async fn test_resolution_is_idempotent() {
    let (api, _) = build_api().await;
    let existing = seed_record(&api, "companies", &[("name", json!("Acme"))]);

    let session_id = prepared_session(
        &api,
        "companies",
        sheet(
            &["ID", "Name"],
            &[row(&[&existing.id, "Acme"]), row(&["", "Fresh"])],
        ),
        vec![ColumnData::field("ID", "id"), ColumnData::field("Name", "name")],
    )
    .await;
    api.begin_review(&session_id).await.unwrap();

    api.resolve_matches(&session_id).await.unwrap();
    let first = rows_of(&api, &session_id).await;

    api.resolve_matches(&session_id).await.unwrap();
    let second = rows_of(&api, &session_id).await;
    assert_eq!(first, second);

    // 人为写入脏结论，重新解析后应恢复
    let mut dirty = second.clone();
    dirty[0].match_action = Some(MatchAction::Create);
    dirty[0].matched_id = None;
    dirty[1].match_action = Some(MatchAction::Update);
    dirty[1].matched_id = Some("stale".to_string());
    api.context().store.update_rows(&session_id, &dirty).unwrap();

    api.resolve_matches(&session_id).await.unwrap();
    let third = rows_of(&api, &session_id).await;
    assert_eq!(first, third);
    assert!(third
        .iter()
        .all(|r| r.matched_id.is_some() == (r.match_action == Some(MatchAction::Update))));
}

#[tokio::test]
async fn test_resolve_requires_existing_session() {
    let (api, _) = build_api().await;
    let err = api.resolve_matches("missing").await.unwrap_err();
    assert!(matches!(err, crm_import::ApiError::NotFound(_)));
}
