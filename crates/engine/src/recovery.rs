//! Periodic recovery scan.
//!
//! One pass:
//! - fails RUNNING tasks whose heartbeat went silent (`HEARTBEAT_TIMEOUT`,
//!   routed through the retry policy like any other failure)
//! - moves due RETRYING tasks back to PENDING and hands them to the local pool
//! - lets the local pool pick up PENDING tasks nobody dispatched
//! - deletes expired terminal tasks
//!
//! Every write is guarded by the snapshot the scan observed, so a live
//! heartbeat or a concurrent scanner wins and the task is skipped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::claim::swallow_expected;
use crate::error::TaskError;
use crate::hooks::TerminalHooks;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::task::{Precondition, Task, TaskFailure, TaskStatus};
use crate::worker_pool::{EnqueueOutcome, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// RUNNING tasks silent for longer than this are considered abandoned.
    pub heartbeat_timeout: Duration,
    pub scan_batch_size: u32,
    pub cleanup_batch_size: u32,
    pub cleanup_enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            scan_batch_size: 100,
            cleanup_batch_size: 500,
            cleanup_enabled: true,
        }
    }
}

/// Counts from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub stale_found: u32,
    /// Stale tasks sent to RETRYING.
    pub stale_retried: u32,
    /// Stale tasks that exhausted their attempts.
    pub stale_failed: u32,
    pub retries_requeued: u32,
    pub dispatched: u32,
    pub cleaned_up: u64,
    /// Guarded writes lost to a concurrent actor.
    pub skipped: u32,
    /// Storage errors; the scan continues past them.
    pub errors: u32,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct RecoveryScanner {
    store: Arc<dyn TaskStore>,
    policy: RetryPolicy,
    config: RecoveryConfig,
    hooks: Option<TerminalHooks>,
    pool: Option<WorkerPool>,
}

impl std::fmt::Debug for RecoveryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryScanner")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl RecoveryScanner {
    pub fn new(store: Arc<dyn TaskStore>, policy: RetryPolicy, config: RecoveryConfig) -> Self {
        Self {
            store,
            policy,
            config,
            hooks: None,
            pool: None,
        }
    }

    /// Run terminal hooks (DLQ escalation, webhooks) for tasks this scanner fails.
    pub fn with_hooks(mut self, hooks: TerminalHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Dispatch requeued and PENDING tasks to a local pool.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub async fn scan_once(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        if let Err(e) = self.recover_stale(&mut report).await {
            report.errors += 1;
            warn!(error = %e, "stale task scan failed");
        }
        if let Err(e) = self.requeue_due(&mut report).await {
            report.errors += 1;
            warn!(error = %e, "retry scan failed");
        }
        if let Some(pool) = &self.pool {
            match pool.poll_pending().await {
                Ok(n) => report.dispatched += n as u32,
                Err(e) => {
                    report.errors += 1;
                    warn!(error = %e, "pending dispatch failed");
                }
            }
        }
        if self.config.cleanup_enabled {
            match self.store.cleanup_expired(self.config.cleanup_batch_size).await {
                Ok(n) => report.cleaned_up = n,
                Err(e) => {
                    report.errors += 1;
                    warn!(error = %e, "expired task cleanup failed");
                }
            }
        }

        if report.is_empty() {
            debug!("recovery scan found nothing to do");
        } else {
            info!(?report, "recovery scan finished");
        }
        report
    }

    async fn recover_stale(&self, report: &mut RecoveryReport) -> Result<(), TaskError> {
        let timeout = self.config.heartbeat_timeout;
        let stale = self
            .store
            .find_stale_running(timeout, self.config.scan_batch_size)
            .await?;
        report.stale_found = stale.len() as u32;

        let failure = TaskFailure::heartbeat_timeout(timeout);
        for task in stale {
            let written = swallow_expected(
                task.id,
                "fail_stale",
                self.store
                    .fail(task.id, &failure, &self.policy, Precondition::observed(&task))
                    .await,
            );
            match written {
                Ok(Some(failed)) => self.record_stale(report, &task, &failed).await,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(task_id = %task.id, error = %e, "failed to recover stale task");
                }
            }
        }
        Ok(())
    }

    async fn record_stale(&self, report: &mut RecoveryReport, stale: &Task, failed: &Task) {
        info!(
            task_id = %failed.id,
            worker_id = stale.worker_id.as_deref().unwrap_or("-"),
            attempt = failed.attempt_count,
            status = %failed.status,
            "recovered stale task"
        );
        if failed.status == TaskStatus::Retrying {
            report.stale_retried += 1;
            return;
        }
        report.stale_failed += 1;
        if let Some(hooks) = &self.hooks {
            hooks.settle(failed).await;
        }
    }

    async fn requeue_due(&self, report: &mut RecoveryReport) -> Result<(), TaskError> {
        let due = self
            .store
            .find_ready_for_retry(self.config.scan_batch_size)
            .await?;

        for task in due {
            match swallow_expected(task.id, "requeue", self.store.requeue(task.id).await) {
                Ok(Some(requeued)) => {
                    report.retries_requeued += 1;
                    debug!(task_id = %requeued.id, attempt = requeued.attempt_count, "retry requeued");
                    let accepted = self
                        .pool
                        .as_ref()
                        .map(|pool| pool.enqueue(requeued.id) == EnqueueOutcome::Accepted);
                    if accepted == Some(true) {
                        report.dispatched += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(task_id = %task.id, error = %e, "failed to requeue retry");
                }
            }
        }
        Ok(())
    }

    /// Run `scan_once` every `interval` until the handle is shut down.
    pub fn spawn(self) -> RecoveryHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "recovery scanner started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.scan_once().await;
                    }
                }
            }
            info!("recovery scanner stopped");
        });

        RecoveryHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

/// Handle to stop a spawned scanner.
#[derive(Debug)]
pub struct RecoveryHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RecoveryHandle {
    /// Signal shutdown and wait for the in-progress scan (if any) to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "recovery scanner task ended abnormally");
            }
        }
    }
}
