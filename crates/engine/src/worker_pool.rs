//! Bounded in-process executor.
//!
//! Each execution: claim -> resolve executor by kind -> run with a progress
//! reporter while heartbeating -> `complete` or `fail` under the claimed
//! attempt -> terminal hooks. The pool also keeps a set of task ids executing
//! locally and refuses a second local dispatch of the same id.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use forgetask_core::TaskId;

use crate::claim::{swallow_expected, try_claim, try_claim_retry};
use crate::error::TaskError;
use crate::executor::{ExecutionContext, ExecutorRegistry, ProgressReporter};
use crate::hooks::TerminalHooks;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::task::{Precondition, Task, TaskFailure, TaskStatus, WorkerId};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent executions.
    pub size: usize,
    /// How often a running execution refreshes `last_heartbeat_at`.
    pub heartbeat_interval: Duration,
    pub worker_id: WorkerId,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            heartbeat_interval: Duration::from_secs(10),
            worker_id: WorkerId::generate(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Already executing (or queued) in this process.
    AlreadyInFlight,
    /// Pool is shut down; the task stays in the store for a later recovery pass.
    ShutDown,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    /// Claims lost to another worker.
    pub claims_skipped: u64,
    /// Results dropped because the attempt no longer owned the task.
    pub results_discarded: u64,
    pub in_flight: usize,
}

enum Dispatch {
    Claim(TaskId),
    Claimed(Task),
}

struct PoolInner {
    store: Arc<dyn TaskStore>,
    registry: ExecutorRegistry,
    policy: RetryPolicy,
    hooks: TerminalHooks,
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<TaskId>>,
    shutdown: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    stats: Mutex<PoolStats>,
}

impl PoolInner {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self, f: impl FnOnce(&mut PoolStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

/// Removes the id from the in-flight set even if the execution panics.
struct InFlightGuard {
    inner: Arc<PoolInner>,
    id: TaskId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.id);
    }
}

/// Bounded executor shared by the engine and the recovery scanner.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: ExecutorRegistry,
        policy: RetryPolicy,
        hooks: TerminalHooks,
        config: WorkerPoolConfig,
    ) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                store,
                registry,
                policy,
                hooks,
                config,
                permits: Arc::new(Semaphore::new(size)),
                in_flight: Mutex::new(HashSet::new()),
                shutdown: AtomicBool::new(false),
                tasks: Mutex::new(JoinSet::new()),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.config.worker_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn in_flight_ids(&self) -> Vec<TaskId> {
        self.inner.in_flight().iter().copied().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        stats.in_flight = self.inner.in_flight().len();
        stats
    }

    /// Schedule background execution of a PENDING (or due RETRYING) task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, id: TaskId) -> EnqueueOutcome {
        if self.is_shut_down() {
            debug!(task_id = %id, "pool shut down, leaving task for recovery");
            return EnqueueOutcome::ShutDown;
        }
        if !self.inner.in_flight().insert(id) {
            return EnqueueOutcome::AlreadyInFlight;
        }
        self.spawn(id, Dispatch::Claim(id), None);
        EnqueueOutcome::Accepted
    }

    /// Claim up to the free capacity of PENDING tasks and start them.
    /// Returns how many were started.
    ///
    /// Permits are taken before claiming, so a task is only moved to RUNNING
    /// when this pool is certain to execute it.
    pub async fn poll_pending(&self) -> Result<usize, TaskError> {
        if self.is_shut_down() {
            return Ok(0);
        }
        let exclude = self.in_flight_ids();
        let free = self.inner.config.size.saturating_sub(exclude.len());

        let mut permits: Vec<OwnedSemaphorePermit> = Vec::with_capacity(free);
        while permits.len() < free {
            match self.inner.permits.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            return Ok(0);
        }

        let claimed = self
            .inner
            .store
            .claim_batch(permits.len() as u32, &exclude, self.worker_id())
            .await?;
        let started = claimed.len();

        for (task, permit) in claimed.into_iter().zip(permits) {
            self.inner.in_flight().insert(task.id);
            self.inner.bump(|s| s.tasks_claimed += 1);
            self.spawn(task.id, Dispatch::Claimed(task), Some(permit));
        }
        Ok(started)
    }

    fn spawn(&self, id: TaskId, dispatch: Dispatch, permit: Option<OwnedSemaphorePermit>) {
        let inner = self.inner.clone();
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let _guard = InFlightGuard {
                inner: inner.clone(),
                id,
            };
            let _permit = match permit {
                Some(permit) => permit,
                None => match inner.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!(task_id = %id, "pool closed before execution started");
                        return;
                    }
                },
            };
            if let Err(e) = run(&inner, dispatch).await {
                warn!(task_id = %id, error = %e, "task execution aborted by storage error");
            }
        });
    }

    /// Poll until nothing is executing locally.
    pub async fn wait_idle(&self) {
        while !self.inner.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting work and wait up to `grace` for running executions.
    /// Executions still running after that are aborted; their tasks stay
    /// RUNNING until the recovery scanner times them out.
    pub async fn shutdown(&self, grace: Duration) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let mut tasks = std::mem::take(
            &mut *self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()),
        );
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.worker_id(),
                remaining = tasks.len(),
                "shutdown grace elapsed, aborting executions"
            );
            tasks.shutdown().await;
        }
        info!(worker_id = %self.worker_id(), "worker pool stopped");
    }
}

async fn run(inner: &PoolInner, dispatch: Dispatch) -> Result<(), TaskError> {
    let task = match dispatch {
        Dispatch::Claimed(task) => task,
        Dispatch::Claim(id) => {
            let Some(task) = claim(inner, id).await? else {
                inner.bump(|s| s.claims_skipped += 1);
                return Ok(());
            };
            inner.bump(|s| s.tasks_claimed += 1);
            task
        }
    };
    execute(inner, task).await
}

async fn claim(inner: &PoolInner, id: TaskId) -> Result<Option<Task>, TaskError> {
    let store = inner.store.as_ref();
    let worker = &inner.config.worker_id;
    let current = swallow_expected(id, "get", store.get(id).await)?.flatten();

    match current.map(|t| t.status) {
        Some(TaskStatus::Pending) => try_claim(store, id, worker).await,
        Some(TaskStatus::Retrying) => try_claim_retry(store, id, worker).await,
        _ => Ok(None),
    }
}

async fn execute(inner: &PoolInner, task: Task) -> Result<(), TaskError> {
    let attempt = task.attempt_count;
    let guard = Precondition::attempt(attempt);
    let store = inner.store.as_ref();

    let Some(executor) = inner.registry.resolve(&task.kind) else {
        warn!(task_id = %task.id, kind = %task.kind, "no executor registered for kind");
        let failure = TaskFailure::unknown_kind(&task.kind);
        return record_failure(inner, &task, &failure, guard).await;
    };

    debug!(task_id = %task.id, kind = %task.kind, attempt, "executing task");
    let ctx = ExecutionContext {
        task_id: task.id,
        kind: task.kind.clone(),
        input: task.input_params.clone(),
        attempt,
        max_attempts: task.max_attempts,
        progress: ProgressReporter::new(inner.store.clone(), task.id, attempt),
    };

    let period = inner.config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    let execution = executor.execute(ctx);
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            outcome = &mut execution => break Some(outcome),
            _ = ticker.tick() => {
                match store.heartbeat(task.id, guard).await {
                    Ok(_) => {}
                    Err(e) if e.is_expected_under_concurrency() => {
                        info!(task_id = %task.id, error = %e, "lost ownership, abandoning execution");
                        break None;
                    }
                    Err(e) => warn!(task_id = %task.id, error = %e, "heartbeat failed"),
                }
            }
        }
    };

    match outcome {
        None => {
            inner.bump(|s| s.results_discarded += 1);
            Ok(())
        }
        Some(Ok(output)) => {
            let completed = swallow_expected(
                task.id,
                "complete",
                store
                    .complete(task.id, output.result, output.usage, guard)
                    .await,
            )?;
            match completed {
                Some(done) => {
                    inner.bump(|s| s.tasks_completed += 1);
                    info!(task_id = %done.id, kind = %done.kind, attempt, "task completed");
                    inner.hooks.settle(&done).await;
                }
                None => {
                    inner.bump(|s| s.results_discarded += 1);
                    info!(task_id = %task.id, "result discarded, task no longer owned by this attempt");
                }
            }
            Ok(())
        }
        Some(Err(err)) => {
            debug!(task_id = %task.id, kind = ?err.kind, error = %err, "execution failed");
            record_failure(inner, &task, &TaskFailure::from(&err), guard).await
        }
    }
}

async fn record_failure(
    inner: &PoolInner,
    task: &Task,
    failure: &TaskFailure,
    guard: Precondition,
) -> Result<(), TaskError> {
    let failed = swallow_expected(
        task.id,
        "fail",
        inner
            .store
            .fail(task.id, failure, &inner.policy, guard)
            .await,
    )?;
    let Some(failed) = failed else {
        inner.bump(|s| s.results_discarded += 1);
        return Ok(());
    };

    match failed.status {
        TaskStatus::Retrying => {
            inner.bump(|s| s.tasks_retried += 1);
            info!(
                task_id = %failed.id,
                attempt = failed.attempt_count,
                next_retry_at = ?failed.next_retry_at,
                code = %failure.code,
                "retry scheduled"
            );
        }
        _ => {
            inner.bump(|s| s.tasks_failed += 1);
            warn!(
                task_id = %failed.id,
                attempt = failed.attempt_count,
                code = %failure.code,
                error = %failure.message,
                "task failed permanently"
            );
            inner.hooks.settle(&failed).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, ExecutionOutput};
    use crate::notify::NoopNotifier;
    use crate::store::InMemoryTaskStore;
    use crate::task::NewTask;
    use crate::task::failure::UNKNOWN_TASK_KIND_CODE;
    use serde_json::json;
    use tokio::sync::Notify;

    fn pool_with(store: Arc<InMemoryTaskStore>, registry: ExecutorRegistry) -> WorkerPool {
        let hooks = TerminalHooks::new(store.clone(), Arc::new(NoopNotifier));
        WorkerPool::new(
            store,
            registry,
            RetryPolicy::default(),
            hooks,
            WorkerPoolConfig::default()
                .with_size(2)
                .with_heartbeat_interval(Duration::from_millis(20)),
        )
    }

    async fn submit(store: &InMemoryTaskStore, kind: &str) -> Task {
        store.create(NewTask::new(kind, json!({"n": 2}))).await.unwrap().task
    }

    #[tokio::test]
    async fn executes_and_completes() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("double", |ctx: ExecutionContext| async move {
            ctx.progress.percent(50).await.ok();
            let n = ctx.input["n"].as_i64().unwrap_or_default();
            Ok(ExecutionOutput::new(json!({"value": n * 2})))
        });
        let pool = pool_with(store.clone(), registry);
        let task = submit(&store, "double").await;

        assert_eq!(pool.enqueue(task.id), EnqueueOutcome::Accepted);
        pool.wait_idle().await;

        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"value": 4})));
        assert_eq!(done.progress_percent, 100);
        assert_eq!(pool.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn duplicate_local_dispatch_is_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let release = Arc::new(Notify::new());
        let mut registry = ExecutorRegistry::new();
        let gate = release.clone();
        registry.register_fn("slow", move |_ctx: ExecutionContext| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(ExecutionOutput::new(json!(null)))
            }
        });
        let pool = pool_with(store.clone(), registry);
        let task = submit(&store, "slow").await;

        assert_eq!(pool.enqueue(task.id), EnqueueOutcome::Accepted);
        assert_eq!(pool.enqueue(task.id), EnqueueOutcome::AlreadyInFlight);

        release.notify_one();
        pool.wait_idle().await;
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().attempt_count,
            1
        );
    }

    #[tokio::test]
    async fn retryable_error_schedules_retry() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("flaky", |_ctx: ExecutionContext| async move {
            Err::<ExecutionOutput, _>(ExecutionError::transient("rate limited"))
        });
        let pool = pool_with(store.clone(), registry);
        let task = submit(&store, "flaky").await;

        pool.enqueue(task.id);
        pool.wait_idle().await;

        let retrying = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(retrying.status, TaskStatus::Retrying);
        assert_eq!(retrying.attempt_count, 1);
        assert_eq!(retrying.last_error.as_deref(), Some("rate limited"));
        assert!(retrying.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn unknown_kind_fails_permanently() {
        let store = Arc::new(InMemoryTaskStore::new());
        let pool = pool_with(store.clone(), ExecutorRegistry::new());
        let task = submit(&store, "mystery").await;

        pool.enqueue(task.id);
        pool.wait_idle().await;

        let failed = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some(UNKNOWN_TASK_KIND_CODE));
        assert!(!failed.is_retryable);
    }

    #[tokio::test]
    async fn cancelled_task_result_is_discarded() {
        let store = Arc::new(InMemoryTaskStore::new());
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let mut registry = ExecutorRegistry::new();
        let (gate, signal) = (release.clone(), started.clone());
        registry.register_fn("slow", move |_ctx: ExecutionContext| {
            let (gate, signal) = (gate.clone(), signal.clone());
            async move {
                signal.notify_one();
                gate.notified().await;
                Ok(ExecutionOutput::new(json!("late")))
            }
        });
        let pool = pool_with(store.clone(), registry);
        let task = submit(&store, "slow").await;

        pool.enqueue(task.id);
        started.notified().await;
        store
            .cancel(task.id, Some("user abort"), Precondition::none())
            .await
            .unwrap();
        release.notify_one();
        pool.wait_idle().await;

        let cancelled = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.result.is_none());
        assert_eq!(pool.stats().results_discarded, 1);
    }

    #[tokio::test]
    async fn poll_pending_respects_capacity() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("*", |_ctx: ExecutionContext| async move {
            Ok::<_, ExecutionError>(ExecutionOutput::new(json!(true)))
        });
        let pool = pool_with(store.clone(), registry);
        for _ in 0..3 {
            submit(&store, "any").await;
        }

        assert_eq!(pool.poll_pending().await.unwrap(), 2);
        pool.wait_idle().await;
        assert_eq!(pool.poll_pending().await.unwrap(), 1);
        pool.wait_idle().await;

        let done = store
            .count(&crate::task::TaskFilter::status(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done, 3);
    }

    #[tokio::test]
    async fn shut_down_pool_leaves_task_pending() {
        let store = Arc::new(InMemoryTaskStore::new());
        let pool = pool_with(store.clone(), ExecutorRegistry::new());
        pool.shutdown(Duration::from_secs(1)).await;

        let task = submit(&store, "k").await;
        assert_eq!(pool.enqueue(task.id), EnqueueOutcome::ShutDown);
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn shutdown_after_poll_runs_claimed_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("once", |_ctx: ExecutionContext| async move {
            Ok::<_, ExecutionError>(ExecutionOutput::new(json!("done")))
        });
        let pool = pool_with(store.clone(), registry);
        let task = store
            .create(NewTask::new("once", json!({})).with_max_attempts(1))
            .await
            .unwrap()
            .task;

        assert_eq!(pool.poll_pending().await.unwrap(), 1);
        pool.shutdown(Duration::from_secs(1)).await;

        let settled = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Completed);
        assert_eq!(settled.attempt_count, 1);
        assert_eq!(settled.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn poll_after_shutdown_claims_nothing() {
        let store = Arc::new(InMemoryTaskStore::new());
        let pool = pool_with(store.clone(), ExecutorRegistry::new());
        let task = submit(&store, "k").await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(pool.poll_pending().await.unwrap(), 0);
        let untouched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);
        assert_eq!(untouched.attempt_count, 0);
    }

    #[tokio::test]
    async fn poll_pending_claims_only_free_permits() {
        let store = Arc::new(InMemoryTaskStore::new());
        let gate = Arc::new(Notify::new());
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("*", move |_ctx: ExecutionContext| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, ExecutionError>(ExecutionOutput::new(json!(null)))
            }
        });
        let pool = pool_with(store.clone(), registry);
        for _ in 0..3 {
            submit(&store, "any").await;
        }

        assert_eq!(pool.poll_pending().await.unwrap(), 2);
        assert_eq!(pool.poll_pending().await.unwrap(), 0);
        let pending = store
            .count(&crate::task::TaskFilter::status(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending, 1);

        pool.shutdown(Duration::from_millis(10)).await;
    }
}
