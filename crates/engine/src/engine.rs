//! `TaskEngine`: the submission API and the wiring between components.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use forgetask_core::{DeadLetterId, TaskId};

use crate::config::EngineConfig;
use crate::dead_letter::{DeadLetterRecord, DeadLetterStats, DeadLetterStore, FailureEntry};
use crate::error::TaskError;
use crate::executor::ExecutorRegistry;
use crate::hooks::TerminalHooks;
use crate::notify::Notifier;
use crate::progress::{ProgressStreamer, StreamEvent};
use crate::recovery::{RecoveryHandle, RecoveryScanner};
use crate::store::TaskStore;
use crate::task::{NewTask, Pagination, Precondition, Task, TaskEvent, TaskFilter, TaskStatus};
use crate::worker_pool::{EnqueueOutcome, PoolStats, WorkerPool};

/// Parameters of one submission. Unset `max_attempts` falls back to
/// [`EngineConfig::default_max_attempts`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub kind: String,
    pub input_params: JsonValue,
    pub idempotency_key: Option<String>,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub webhook_url: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl SubmitRequest {
    pub fn new(kind: impl Into<String>, input_params: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            input_params,
            idempotency_key: None,
            priority: None,
            max_attempts: None,
            webhook_url: None,
            metadata: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn into_new_task(self, default_max_attempts: u32) -> NewTask {
        let mut spec = NewTask::new(self.kind, self.input_params)
            .with_priority(self.priority.unwrap_or_default())
            .with_max_attempts(self.max_attempts.unwrap_or(default_max_attempts));
        spec.idempotency_key = self.idempotency_key;
        spec.webhook_url = self.webhook_url;
        if let Some(metadata) = self.metadata {
            spec.metadata = metadata;
        }
        spec
    }
}

/// Result of [`TaskEngine::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task: Task,
    /// `false` when an unexpired task with the same idempotency key was
    /// returned instead of creating a new one.
    pub created: bool,
}

/// In-process engine over a shared store.
///
/// Several engines (processes) may share one PostgreSQL store; they
/// coordinate only through guarded store writes.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    hooks: TerminalHooks,
    pool: WorkerPool,
    streamer: ProgressStreamer,
    config: EngineConfig,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    pub fn new<S>(
        store: Arc<S>,
        registry: ExecutorRegistry,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self
    where
        S: TaskStore + DeadLetterStore + 'static,
    {
        let tasks: Arc<dyn TaskStore> = store.clone();
        let dead_letters: Arc<dyn DeadLetterStore> = store;

        let mut hooks = TerminalHooks::new(tasks.clone(), notifier);
        if config.dead_letter_on_exhaustion {
            hooks = hooks.with_dead_letters(dead_letters.clone());
        }
        let pool = WorkerPool::new(
            tasks.clone(),
            registry,
            config.retry,
            hooks.clone(),
            config.pool.clone(),
        );
        let streamer = ProgressStreamer::new(tasks.clone(), config.stream);

        info!(
            worker_id = %config.pool.worker_id,
            pool_size = config.pool.size,
            dead_letter_on_exhaustion = config.dead_letter_on_exhaustion,
            "task engine initialised"
        );

        Self {
            store: tasks,
            dead_letters,
            hooks,
            pool,
            streamer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Validate, persist (or dedupe by idempotency key) and dispatch.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, TaskError> {
        let spec = request.into_new_task(self.config.default_max_attempts);
        spec.validate()?;

        let outcome = self.store.create(spec).await?;
        if outcome.created {
            debug!(task_id = %outcome.task.id, kind = %outcome.task.kind, "task submitted");
            self.dispatch(outcome.task.id);
        } else {
            debug!(
                task_id = %outcome.task.id,
                key = outcome.task.idempotency_key.as_deref().unwrap_or_default(),
                "duplicate submission collapsed onto existing task"
            );
        }
        Ok(Submission {
            task: outcome.task,
            created: outcome.created,
        })
    }

    fn dispatch(&self, id: TaskId) {
        match self.pool.enqueue(id) {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::AlreadyInFlight => debug!(task_id = %id, "task already in flight"),
            EnqueueOutcome::ShutDown => {
                info!(task_id = %id, "pool shut down; task left PENDING for recovery")
            }
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskError> {
        self.store.list(filter, pagination).await
    }

    pub async fn count(&self, filter: &TaskFilter) -> Result<u64, TaskError> {
        self.store.count(filter).await
    }

    pub async fn events(&self, id: TaskId) -> Result<Vec<TaskEvent>, TaskError> {
        self.store.events(id).await
    }

    /// Cancel a non-terminal task. A running execution keeps going until it
    /// notices, but its result is discarded.
    pub async fn cancel(&self, id: TaskId, reason: Option<&str>) -> Result<Task, TaskError> {
        let task = self.store.cancel(id, reason, Precondition::none()).await?;
        info!(task_id = %id, reason = reason.unwrap_or("-"), "task cancelled");
        Ok(task)
    }

    pub fn stream(&self, id: TaskId) -> ReceiverStream<StreamEvent> {
        self.streamer.stream(id)
    }

    /// Scanner wired to this engine's pool and terminal hooks.
    pub fn recovery_scanner(&self) -> RecoveryScanner {
        RecoveryScanner::new(self.store.clone(), self.config.retry, self.config.recovery)
            .with_hooks(self.hooks.clone())
            .with_pool(self.pool.clone())
    }

    pub fn start_recovery(&self) -> RecoveryHandle {
        self.recovery_scanner().spawn()
    }

    pub async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        failure_history: Option<Vec<FailureEntry>>,
    ) -> Result<DeadLetterRecord, TaskError> {
        self.dead_letters
            .move_to_dead_letter(task_id, failure_history)
            .await
    }

    /// Create a fresh task from a dead-letter record and dispatch it.
    pub async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<Task, TaskError> {
        let task = self.dead_letters.requeue_dead_letter(id).await?;
        info!(dead_letter_id = %id, task_id = %task.id, "dead letter requeued");
        if task.status == TaskStatus::Pending {
            self.dispatch(task.id);
        }
        Ok(task)
    }

    pub async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, TaskError> {
        self.dead_letters.get_dead_letter(id).await
    }

    pub async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterRecord>, TaskError> {
        self.dead_letters.list_dead_letters(pagination).await
    }

    pub async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), TaskError> {
        self.dead_letters.delete_dead_letter(id).await
    }

    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats, TaskError> {
        self.dead_letters.dead_letter_stats().await
    }

    /// Stop dispatching and wait up to `grace` for running executions.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}
