//! Standalone recovery process for deployments where request-serving
//! processes host the worker pools: fails stale RUNNING tasks, requeues due
//! retries and deletes expired terminal tasks in the shared PostgreSQL store.
//!
//! Requeued tasks are left PENDING for the pools to claim.

use std::sync::Arc;

use anyhow::Context;

use forgetask_engine::{
    DeadLetterStore, EngineConfig, HttpNotifier, PostgresTaskStore, RecoveryScanner, TaskStore,
    TerminalHooks,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgetask_observability::init();

    let config = EngineConfig::from_env().context("invalid FORGETASK_* configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = std::env::var("FORGETASK_DB_MAX_CONNECTIONS")
        .ok()
        .map(|v| v.parse::<u32>())
        .transpose()
        .context("FORGETASK_DB_MAX_CONNECTIONS must be a positive integer")?
        .unwrap_or(5);
    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");

    let store = Arc::new(
        PostgresTaskStore::connect(&database_url, max_connections)
            .await
            .context("failed to connect to Postgres")?
            .with_settings(config.store),
    );
    store.migrate().await.context("failed to apply migrations")?;

    let tasks: Arc<dyn TaskStore> = store.clone();
    let notifier = Arc::new(HttpNotifier::new(config.webhook).context("webhook client")?);
    let mut hooks = TerminalHooks::new(tasks.clone(), notifier);
    if config.dead_letter_on_exhaustion {
        let dead_letters: Arc<dyn DeadLetterStore> = store.clone();
        hooks = hooks.with_dead_letters(dead_letters);
    }
    let scanner = RecoveryScanner::new(tasks, config.retry, config.recovery).with_hooks(hooks);

    if run_once {
        let report = scanner.scan_once().await;
        tracing::info!(?report, "single sweep finished");
        return Ok(());
    }

    tracing::info!(
        interval_secs = config.recovery.interval.as_secs(),
        heartbeat_timeout_secs = config.recovery.heartbeat_timeout.as_secs(),
        "sweeper running"
    );
    let handle = scanner.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
