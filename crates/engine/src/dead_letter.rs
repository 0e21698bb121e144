//! Dead-letter queue.
//!
//! Holds tasks that exhausted their retry budget together with their failure
//! history. A dead-lettered task is never executed again; `requeue` creates a
//! brand-new task linked back through its metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use forgetask_core::{DeadLetterId, TaskId};

use crate::error::TaskError;
use crate::task::{FailureCategory, NewTask, Pagination, Task, TaskEvent, TaskEventType};

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub attempt: u32,
    pub error: String,
    pub code: Option<String>,
    pub category: Option<FailureCategory>,
    pub occurred_at: DateTime<Utc>,
}

/// A task parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    /// Snapshot of the task at the moment it was moved.
    pub task: Task,
    /// Ordered by attempt.
    pub failure_history: Vec<FailureEntry>,
    pub moved_at: DateTime<Utc>,
    pub requeued_at: Option<DateTime<Utc>>,
    pub requeue_count: u32,
    pub last_requeued_task_id: Option<TaskId>,
}

impl DeadLetterRecord {
    pub fn new(task: Task, mut failure_history: Vec<FailureEntry>, moved_at: DateTime<Utc>) -> Self {
        failure_history.sort_by_key(|entry| (entry.attempt, entry.occurred_at));
        Self {
            id: DeadLetterId::new(),
            task,
            failure_history,
            moved_at,
            requeued_at: None,
            requeue_count: 0,
            last_requeued_task_id: None,
        }
    }

    /// Spec for the replacement task: same kind and input, fresh counters,
    /// metadata linking back to this record and the original task.
    pub fn requeue_spec(&self) -> NewTask {
        let mut metadata = match &self.task.metadata {
            JsonValue::Object(map) => map.clone(),
            _ => Default::default(),
        };
        metadata.insert("dead_letter_id".into(), json!(self.id));
        metadata.insert("requeued_from_task_id".into(), json!(self.task.id));

        let mut spec = NewTask::new(self.task.kind.clone(), self.task.input_params.clone())
            .with_priority(self.task.priority)
            .with_max_attempts(self.task.max_attempts)
            .with_metadata(JsonValue::Object(metadata));
        spec.webhook_url = self.task.webhook_url.clone();
        spec
    }

    pub fn record_requeue(&mut self, new_task_id: TaskId, now: DateTime<Utc>) {
        self.requeue_count += 1;
        self.requeued_at = Some(now);
        self.last_requeued_task_id = Some(new_task_id);
    }
}

/// Dead-letter queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    /// Never requeued.
    pub pending: u64,
    pub requeued: u64,
}

impl DeadLetterStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DeadLetterRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut stats, record| {
            stats.total += 1;
            if record.requeue_count == 0 {
                stats.pending += 1;
            } else {
                stats.requeued += 1;
            }
            stats
        })
    }
}

/// Rebuild the per-attempt failure history from a task's audit log.
pub fn failure_history_from_events(events: &[TaskEvent]) -> Vec<FailureEntry> {
    let mut history: Vec<FailureEntry> = events
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                TaskEventType::RetryScheduled | TaskEventType::Failed
            )
        })
        .map(|e| FailureEntry {
            attempt: e
                .event_data
                .get("attempt")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as u32,
            error: e
                .event_data
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            code: e
                .event_data
                .get("code")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            category: e
                .event_data
                .get("category")
                .cloned()
                .and_then(|c| serde_json::from_value(c).ok()),
            occurred_at: e.created_at,
        })
        .collect();
    history.sort_by_key(|entry| (entry.attempt, entry.occurred_at));
    history
}

/// Storage contract for the dead-letter queue.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Snapshot the task and mark it dead-lettered. Accepted from FAILED,
    /// RETRYING or PENDING; a second call for the same task returns the
    /// existing record. History is rebuilt from events when not supplied.
    async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        failure_history: Option<Vec<FailureEntry>>,
    ) -> Result<DeadLetterRecord, TaskError>;

    /// Create a fresh task from the record. While the previously requeued
    /// task is still in flight, that task is returned unchanged.
    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<Task, TaskError>;

    async fn get_dead_letter(&self, id: DeadLetterId)
    -> Result<Option<DeadLetterRecord>, TaskError>;

    /// Oldest first.
    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterRecord>, TaskError>;

    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), TaskError>;

    async fn dead_letter_stats(&self) -> Result<DeadLetterStats, TaskError>;
}
