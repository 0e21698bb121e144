//! Post-settlement side effects: dead-letter escalation and webhooks.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dead_letter::DeadLetterStore;
use crate::notify::{Notifier, WebhookPayload};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

/// Runs after a task reaches a terminal state.
#[derive(Clone)]
pub struct TerminalHooks {
    store: Arc<dyn TaskStore>,
    /// When set, permanently failed tasks are escalated to the DLQ.
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for TerminalHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHooks")
            .field("dead_letter_on_exhaustion", &self.dead_letters.is_some())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl TerminalHooks {
    pub fn new(store: Arc<dyn TaskStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            dead_letters: None,
            notifier,
        }
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Best-effort; never fails the caller.
    pub async fn settle(&self, task: &Task) {
        if !task.status.is_terminal() {
            return;
        }
        if task.status == TaskStatus::Failed && task.dead_lettered_at.is_none() {
            self.escalate(task).await;
        }
        if task.webhook_url.is_some()
            && matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
        {
            self.notify(task).await;
        }
    }

    async fn escalate(&self, task: &Task) {
        let Some(dead_letters) = &self.dead_letters else {
            return;
        };
        match dead_letters.move_to_dead_letter(task.id, None).await {
            Ok(record) => info!(
                task_id = %task.id,
                dead_letter_id = %record.id,
                attempts = task.attempt_count,
                "task moved to dead letter queue"
            ),
            Err(e) if e.is_expected_under_concurrency() => {
                debug!(task_id = %task.id, error = %e, "dead-letter escalation skipped")
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "dead-letter escalation failed"),
        }
    }

    async fn notify(&self, task: &Task) {
        // Only the process that wins the stamp sends.
        let stamped = match self.store.mark_notified(task.id).await {
            Ok(stamped) => stamped,
            Err(e) if e.is_expected_under_concurrency() => {
                debug!(task_id = %task.id, error = %e, "webhook already handled");
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to stamp webhook notification");
                return;
            }
        };

        let (Some(url), Some(payload)) = (&stamped.webhook_url, WebhookPayload::for_task(&stamped))
        else {
            return;
        };
        match self.notifier.notify(url, &payload).await {
            Ok(()) => debug!(task_id = %task.id, "webhook delivered"),
            Err(e) => warn!(task_id = %task.id, error = %e, "webhook delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryTaskStore;
    use crate::task::{FailureCategory, NewTask, Precondition, TaskFailure, WorkerId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, WebhookPayload)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((url.to_string(), payload.clone()));
            Ok(())
        }
    }

    async fn failed_task(store: &InMemoryTaskStore, webhook: Option<&str>) -> Task {
        let mut spec = NewTask::new("k", json!({})).with_max_attempts(1);
        spec.webhook_url = webhook.map(str::to_string);
        let task = store.create(spec).await.unwrap().task;
        store.claim(task.id, &WorkerId::new("w")).await.unwrap();
        let failure = TaskFailure::new("bad", "PERMANENT_ERROR", false, FailureCategory::Permanent);
        store
            .fail(task.id, &failure, &RetryPolicy::default(), Precondition::none())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_is_sent_once() {
        let store = Arc::new(InMemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let hooks = TerminalHooks::new(store.clone(), notifier.clone());

        let task = failed_task(&store, Some("https://example.com/hook")).await;
        hooks.settle(&task).await;
        hooks.settle(&task).await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://example.com/hook");
        assert_eq!(sent[0].1.error.as_ref().unwrap().message, "bad");

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert!(stored.notification_sent_at.is_some());
    }

    #[tokio::test]
    async fn failed_task_escalates_when_enabled() {
        let store = Arc::new(InMemoryTaskStore::new());
        let hooks = TerminalHooks::new(store.clone(), Arc::new(crate::notify::NoopNotifier))
            .with_dead_letters(store.clone());

        let task = failed_task(&store, None).await;
        hooks.settle(&task).await;

        assert_eq!(store.dead_letter_stats().await.unwrap().total, 1);
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert!(stored.dead_lettered_at.is_some());
    }

    #[tokio::test]
    async fn failed_task_stays_put_without_dead_letters() {
        let store = Arc::new(InMemoryTaskStore::new());
        let hooks = TerminalHooks::new(store.clone(), Arc::new(crate::notify::NoopNotifier));

        let task = failed_task(&store, None).await;
        hooks.settle(&task).await;

        assert_eq!(store.dead_letter_stats().await.unwrap().total, 0);
    }
}
