//! Durable task storage.
//!
//! The store is the single source of truth: workers, the recovery scanner and
//! progress streams coordinate only through it. Every status-dependent write
//! re-checks status (and, when asked, version/attempt) in the same atomic
//! operation as the update.

mod memory;
mod postgres;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use forgetask_core::TaskId;

use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::task::{
    CreateOutcome, NewTask, Pagination, Precondition, ProgressUpdate, Task, TaskEvent,
    TaskFailure, TaskFilter, WorkerId,
};

/// Time windows applied by the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// How long an idempotency key keeps resolving to its task.
    pub idempotency_window: Duration,
    /// How long terminal tasks are kept before `cleanup_expired` removes them.
    pub retention: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            idempotency_window: Duration::from_secs(24 * 3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Storage contract for tasks and their audit events.
///
/// Guarded writes that lose a race fail with [`TaskError::Conflict`]; missing
/// tasks fail with [`TaskError::NotFound`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Current time according to the store's clock.
    fn now(&self) -> DateTime<Utc>;

    /// Insert a PENDING task, or return the unexpired task already holding
    /// the same idempotency key with `created = false`.
    async fn create(&self, spec: NewTask) -> Result<CreateOutcome, TaskError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError>;

    /// Newest first.
    async fn list(&self, filter: &TaskFilter, pagination: Pagination)
    -> Result<Vec<Task>, TaskError>;

    async fn count(&self, filter: &TaskFilter) -> Result<u64, TaskError>;

    /// Audit log in transition order.
    async fn events(&self, id: TaskId) -> Result<Vec<TaskEvent>, TaskError>;

    /// RUNNING only. Also refreshes the heartbeat.
    async fn update_progress(
        &self,
        id: TaskId,
        update: &ProgressUpdate,
        pre: Precondition,
    ) -> Result<Task, TaskError>;

    /// RUNNING only.
    async fn heartbeat(&self, id: TaskId, pre: Precondition) -> Result<Task, TaskError>;

    /// RUNNING -> COMPLETED.
    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        usage_metrics: Option<JsonValue>,
        pre: Precondition,
    ) -> Result<Task, TaskError>;

    /// RUNNING -> RETRYING or FAILED, decided by `policy` inside the write.
    async fn fail(
        &self,
        id: TaskId,
        failure: &TaskFailure,
        policy: &RetryPolicy,
        pre: Precondition,
    ) -> Result<Task, TaskError>;

    /// PENDING | RUNNING | RETRYING -> CANCELLED.
    async fn cancel(
        &self,
        id: TaskId,
        reason: Option<&str>,
        pre: Precondition,
    ) -> Result<Task, TaskError>;

    /// Stamp `notification_sent_at`; conflicts if another caller already did.
    async fn mark_notified(&self, id: TaskId) -> Result<Task, TaskError>;

    /// Delete up to `batch_size` terminal tasks past `expires_at`, with their
    /// events. Returns the number deleted.
    async fn cleanup_expired(&self, batch_size: u32) -> Result<u64, TaskError>;

    /// PENDING -> RUNNING. Losing a race yields `Conflict`.
    async fn claim(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError>;

    /// RETRYING (due) -> RUNNING.
    async fn claim_retry(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError>;

    /// Claim up to `limit` PENDING tasks by `priority desc, created_at asc`,
    /// skipping `exclude`.
    async fn claim_batch(
        &self,
        limit: u32,
        exclude: &[TaskId],
        worker: &WorkerId,
    ) -> Result<Vec<Task>, TaskError>;

    /// RUNNING tasks whose last heartbeat (or start) is older than `timeout`.
    async fn find_stale_running(
        &self,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<Task>, TaskError>;

    /// RETRYING tasks whose `next_retry_at` has passed.
    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Task>, TaskError>;

    /// RETRYING (due) -> PENDING.
    async fn requeue(&self, id: TaskId) -> Result<Task, TaskError>;
}
