//! Core task types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use forgetask_core::{DomainError, EventId, ExpectedVersion, TaskId};

use crate::clock::chrono_duration;
use crate::error::TaskError;

pub const MAX_KIND_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_ATTEMPTS_LIMIT: u32 = 25;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Failed, waiting for `next_retry_at`.
    Retrying,
    Completed,
    /// Permanently failed (not retryable or attempts exhausted).
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retrying
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("task status", s))
    }
}

/// Identifies the process/thread executing a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `worker-<pid>-<uuid>`, unique per process start.
    pub fn generate() -> Self {
        Self(format!(
            "worker-{}-{}",
            std::process::id(),
            Uuid::now_v7().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to insert a new PENDING task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: String,
    pub input_params: JsonValue,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub max_attempts: u32,
    pub webhook_url: Option<String>,
    /// Free-form object; carries back-links such as `dead_letter_id`.
    pub metadata: JsonValue,
}

impl NewTask {
    pub fn new(kind: impl Into<String>, input_params: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            input_params,
            idempotency_key: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            webhook_url: None,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Structural checks every store applies before inserting.
    pub fn validate(&self) -> Result<(), TaskError> {
        let kind = self.kind.trim();
        if kind.is_empty() {
            return Err(TaskError::validation("task kind must not be empty"));
        }
        if kind.len() > MAX_KIND_LEN {
            return Err(TaskError::validation(format!(
                "task kind exceeds {MAX_KIND_LEN} bytes"
            )));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(TaskError::validation(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            )));
        }
        if let Some(key) = &self.idempotency_key {
            crate::idempotency::validate_key(key)?;
        }
        if let Some(url) = &self.webhook_url {
            validate_webhook_url(url)?;
        }
        if !self.metadata.is_object() {
            return Err(TaskError::validation("metadata must be a JSON object"));
        }
        Ok(())
    }
}

fn validate_webhook_url(url: &str) -> Result<(), TaskError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| TaskError::validation(format!("invalid webhook url '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(()),
        scheme => Err(TaskError::validation(format!(
            "webhook url must be an absolute http(s) url, got scheme '{scheme}'"
        ))),
    }
}

/// The unit of durable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Selects the executor.
    pub kind: String,
    /// Opaque payload handed to the executor.
    pub input_params: JsonValue,
    pub status: TaskStatus,
    /// Optimistic-lock token; incremented on every successful mutation.
    pub version: u64,

    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_retryable: bool,

    /// Non-decreasing within a run.
    pub progress_percent: u8,
    pub progress_message: Option<String>,
    pub current_step: Option<String>,
    pub total_steps: Option<u32>,
    pub current_step_num: Option<u32>,

    /// Set only on COMPLETED.
    pub result: Option<JsonValue>,
    pub usage_metrics: Option<JsonValue>,
    /// Set only on FAILED or CANCELLED.
    pub error_message: Option<String>,
    pub error_code: Option<String>,

    pub idempotency_key: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,

    pub webhook_url: Option<String>,
    pub notification_sent_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal tasks past this instant are removed by `cleanup_expired`.
    pub expires_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Higher claims first.
    pub priority: i32,
    pub metadata: JsonValue,
}

impl Task {
    /// Build a fresh PENDING task at version 1.
    pub fn new(spec: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            kind: spec.kind,
            input_params: spec.input_params,
            status: TaskStatus::Pending,
            version: 1,
            attempt_count: 0,
            max_attempts: spec.max_attempts,
            next_retry_at: None,
            last_error: None,
            is_retryable: true,
            progress_percent: 0,
            progress_message: None,
            current_step: None,
            total_steps: None,
            current_step_num: None,
            result: None,
            usage_metrics: None,
            error_message: None,
            error_code: None,
            idempotency_key: spec.idempotency_key,
            started_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            webhook_url: spec.webhook_url,
            notification_sent_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: None,
            dead_lettered_at: None,
            priority: spec.priority,
            metadata: spec.metadata,
        }
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Last sign of life from the executing worker.
    pub fn liveness_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at.or(self.started_at)
    }

    /// RUNNING and silent for longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        let last_seen = self.liveness_at().unwrap_or(self.updated_at);
        now - last_seen > chrono_duration(timeout)
    }

    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Retrying && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Reject the write unless the task is at the expected version/attempt.
    pub fn check(&self, pre: &Precondition) -> Result<(), TaskError> {
        pre.version.check(self.version)?;
        if let Some(attempt) = pre.attempt {
            if attempt != self.attempt_count {
                return Err(TaskError::conflict(format!(
                    "task {} is on attempt {}, write was made for attempt {attempt}",
                    self.id, self.attempt_count
                )));
            }
        }
        Ok(())
    }
}

/// Guard applied to a write in addition to the status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Precondition {
    pub version: ExpectedVersion,
    /// The attempt the writer claimed; stale attempts lose.
    pub attempt: Option<u32>,
}

impl Precondition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn attempt(attempt: u32) -> Self {
        Self {
            version: ExpectedVersion::Any,
            attempt: Some(attempt),
        }
    }

    pub fn version(version: u64) -> Self {
        Self {
            version: ExpectedVersion::Exact(version),
            attempt: None,
        }
    }

    /// Exactly the state the caller observed.
    pub fn observed(task: &Task) -> Self {
        Self {
            version: ExpectedVersion::Exact(task.version),
            attempt: Some(task.attempt_count),
        }
    }
}

/// Partial progress report from an executor. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Clamped to `[0, 100]`; never lowers the stored value.
    pub percent: Option<i32>,
    pub message: Option<String>,
    pub step: Option<String>,
    pub total_steps: Option<u32>,
    pub step_num: Option<u32>,
}

impl ProgressUpdate {
    pub fn percent(percent: i32) -> Self {
        Self {
            percent: Some(percent),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>, step_num: u32, total_steps: u32) -> Self {
        self.step = Some(step.into());
        self.step_num = Some(step_num);
        self.total_steps = Some(total_steps);
        self
    }
}

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub kind: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self.kind.as_ref().is_none_or(|k| &task.kind == k)
            && self.created_after.is_none_or(|t| task.created_at >= t)
            && self.created_before.is_none_or(|t| task.created_at <= t)
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Created,
    Claimed,
    Completed,
    RetryScheduled,
    Failed,
    Cancelled,
    Requeued,
    DeadLettered,
}

impl TaskEventType {
    pub const ALL: [TaskEventType; 8] = [
        TaskEventType::Created,
        TaskEventType::Claimed,
        TaskEventType::Completed,
        TaskEventType::RetryScheduled,
        TaskEventType::Failed,
        TaskEventType::Cancelled,
        TaskEventType::Requeued,
        TaskEventType::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventType::Created => "created",
            TaskEventType::Claimed => "claimed",
            TaskEventType::Completed => "completed",
            TaskEventType::RetryScheduled => "retry_scheduled",
            TaskEventType::Failed => "failed",
            TaskEventType::Cancelled => "cancelled",
            TaskEventType::Requeued => "requeued",
            TaskEventType::DeadLettered => "dead_lettered",
        }
    }
}

impl FromStr for TaskEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("task event type", s))
    }
}

/// Immutable audit row, one per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: EventId,
    pub task_id: TaskId,
    pub event_type: TaskEventType,
    pub previous_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub event_data: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Result of `TaskStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub task: Task,
    /// `false` when an unexpired task with the same idempotency key was
    /// returned instead of inserting.
    pub created: bool,
}
