// ==========================================
// CRM 导入引擎 - 导入完成通知
// ==========================================
// 职责: 定义通知 trait，执行结束后告知发起人结果
// 说明: 引擎只依赖 trait，具体渠道（站内信/邮件）由外层注入
// ==========================================

use crate::domain::import::ImportResults;
use crate::i18n::t_with_args;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Mutex;

/// 通知结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportOutcome {
    Completed { results: ImportResults },
    Failed { error: String },
}

/// 导入结束通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportNotification {
    pub session_id: String,
    pub team_id: String,
    pub user_id: String,
    pub entity_type: String,
    pub original_filename: String,
    pub outcome: ImportOutcome,
}

impl ImportNotification {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ImportOutcome::Completed { .. })
    }

    /// 本地化标题
    pub fn title(&self) -> String {
        let key = match self.outcome {
            ImportOutcome::Completed { .. } => "notification.import_completed_title",
            ImportOutcome::Failed { .. } => "notification.import_failed_title",
        };
        t_with_args(key, &[("file", self.original_filename.as_str())])
    }

    /// 本地化正文（完整结果明细）
    pub fn body(&self) -> String {
        match &self.outcome {
            ImportOutcome::Completed { results } => t_with_args(
                "notification.import_completed_body",
                &[
                    ("created", results.created.to_string().as_str()),
                    ("updated", results.updated.to_string().as_str()),
                    ("skipped", results.skipped.to_string().as_str()),
                    ("failed", results.failed.to_string().as_str()),
                ],
            ),
            ImportOutcome::Failed { error } => {
                t_with_args("notification.import_failed_body", &[("error", error.as_str())])
            }
        }
    }
}

// ==========================================
// Notifier Trait
// ==========================================
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 发送通知
    ///
    /// # 返回
    /// - Err: 发送失败（调用方只记录日志，不影响会话状态）
    async fn notify(&self, notification: ImportNotification) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 仅写日志的通知器（CLI / 默认）
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: ImportNotification) -> Result<(), Box<dyn Error + Send + Sync>> {
        if notification.is_success() {
            tracing::info!(
                session_id = %notification.session_id,
                user_id = %notification.user_id,
                "{}: {}",
                notification.title(),
                notification.body()
            );
        } else {
            tracing::warn!(
                session_id = %notification.session_id,
                user_id = %notification.user_id,
                "{}: {}",
                notification.title(),
                notification.body()
            );
        }
        Ok(())
    }
}

/// 记录所有通知，供测试断言
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ImportNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ImportNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: ImportNotification) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.sent
            .lock()
            .map_err(|e| format!("通知记录锁获取失败: {}", e))?
            .push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> ImportNotification {
        ImportNotification {
            session_id: "s1".into(),
            team_id: "t1".into(),
            user_id: "u1".into(),
            entity_type: "people".into(),
            original_filename: "people.csv".into(),
            outcome: ImportOutcome::Completed {
                results: ImportResults {
                    created: 3,
                    updated: 2,
                    skipped: 1,
                    failed: 0,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify(completed()).await.unwrap();

        let mut failed = completed();
        failed.outcome = ImportOutcome::Failed {
            error: "boom".into(),
        };
        notifier.notify(failed).await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_success());
        assert!(!sent[1].is_success());
    }

    #[test]
    fn test_outcome_serialises_with_tag() {
        let json = serde_json::to_value(&completed().outcome).unwrap();
        assert_eq!(json["kind"], "completed");
        assert_eq!(json["results"]["created"], 3);
    }
}
