//! PostgreSQL-backed task store.
//!
//! ## Concurrency
//!
//! - Claims are one guarded `UPDATE ... WHERE status = <expected> RETURNING`.
//!   Zero returned rows means someone else won (or the task is gone).
//! - Batch claims select candidates with `FOR UPDATE SKIP LOCKED` and update
//!   them in the same statement, so two workers never see the same candidate.
//! - Every other transition locks the row (`FOR UPDATE`), applies the pure
//!   transition from [`crate::task`] and writes back with
//!   `WHERE id = $1 AND version = $2 AND status = $3`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskError |
//! |------------|----------------------|-----------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use forgetask_core::{DeadLetterId, EventId, TaskId};

use super::{StoreSettings, TaskStore};
use crate::clock::{Clock, SystemClock, chrono_duration};
use crate::dead_letter::{
    DeadLetterRecord, DeadLetterStats, DeadLetterStore, FailureEntry, failure_history_from_events,
};
use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::task::{
    CreateOutcome, NewTask, Pagination, Precondition, ProgressUpdate, Task, TaskEvent,
    TaskFailure, TaskFilter, TaskStatus, Transition, WorkerId,
};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

macro_rules! task_columns {
    () => {
        "id, kind, input_params, status, version, attempt_count, max_attempts, \
         next_retry_at, last_error, is_retryable, progress_percent, progress_message, \
         current_step, total_steps, current_step_num, result, usage_metrics, \
         error_message, error_code, idempotency_key, started_at, last_heartbeat_at, \
         worker_id, webhook_url, notification_sent_at, created_at, updated_at, \
         completed_at, expires_at, dead_lettered_at, priority, metadata"
    };
}

macro_rules! claim_set {
    () => {
        "status = 'running', \
         attempt_count = attempt_count + 1, \
         version = version + 1, \
         started_at = $2, \
         last_heartbeat_at = $2, \
         updated_at = $2, \
         worker_id = $3, \
         next_retry_at = NULL, \
         progress_percent = 0, \
         progress_message = NULL, \
         current_step = NULL, \
         current_step_num = NULL"
    };
}

const EVENT_COLUMNS: &str =
    "id, task_id, event_type, previous_status, new_status, event_data, created_at";

const DEAD_LETTER_COLUMNS: &str = "id, task_id, task_snapshot, failure_history, moved_at, \
     requeued_at, requeue_count, last_requeued_task_id";

/// Postgres-backed task store.
///
/// `Send + Sync` and cheap to clone; all operations go through the SQLx
/// connection pool. Timestamps come from the injected [`Clock`], not `NOW()`,
/// so staleness and expiry agree with the in-memory backend.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            settings: StoreSettings::default(),
        }
    }

    /// Open a connection pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, TaskError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), TaskError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, TaskError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Lock the row, apply `f` to a copy and write it back under a
    /// version + status guard.
    async fn mutate<F>(
        &self,
        operation: &'static str,
        id: TaskId,
        pre: Precondition,
        f: F,
    ) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Task, DateTime<Utc>) -> Result<Option<Transition>, TaskError> + Send,
    {
        let mut tx = self.begin().await?;
        let current = lock_task(&mut tx, id)
            .await?
            .ok_or_else(|| TaskError::not_found(format!("task {id}")))?;
        current.check(&pre)?;

        let now = self.clock.now();
        let mut next = current.clone();
        let transition = f(&mut next, now)?;

        write_guarded(&mut tx, &next, current.version, current.status).await?;
        if let Some(transition) = transition {
            insert_event(&mut tx, &transition.into_event(next.id, now)).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(next)
    }

    async fn claim_from(
        &self,
        id: TaskId,
        from: TaskStatus,
        worker: &WorkerId,
    ) -> Result<Task, TaskError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let retry_guard = match from {
            TaskStatus::Retrying => " AND (next_retry_at IS NULL OR next_retry_at <= $2)",
            _ => "",
        };
        let sql = format!(
            concat!(
                "UPDATE tasks SET ",
                claim_set!(),
                " WHERE id = $1 AND status = $4 AND attempt_count < max_attempts{} RETURNING ",
                task_columns!()
            ),
            retry_guard
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .bind(worker.as_str())
            .bind(from.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match fetch_task(&*self.pool, id).await? {
                Some(task) => TaskError::conflict(format!(
                    "task {id} is {} (attempt {}/{}), not claimable from {from}",
                    task.status, task.attempt_count, task.max_attempts
                )),
                None => TaskError::not_found(format!("task {id}")),
            });
        };

        let task = task_from_row(&row)?;
        insert_event(&mut tx, &Transition::claimed(from, &task).into_event(id, now)).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        Ok(task)
    }

    async fn create_inner(&self, spec: NewTask) -> Result<CreateOutcome, TaskError> {
        let now = self.clock.now();
        let task = Task::new(spec, now);
        let mut tx = self.begin().await?;

        if let Some(key) = &task.idempotency_key {
            let expires_at = now + chrono_duration(self.settings.idempotency_window);
            let reserved: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO task_idempotency_keys (idempotency_key, task_id, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (idempotency_key) DO UPDATE
                    SET task_id = EXCLUDED.task_id, expires_at = EXCLUDED.expires_at
                    WHERE task_idempotency_keys.expires_at <= $4
                RETURNING task_id
                "#,
            )
            .bind(key)
            .bind(task.id.as_uuid())
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reserve_idempotency_key", e))?;

            if reserved.is_none() {
                if let Some(existing) = lookup_key(&mut tx, key).await? {
                    tx.commit()
                        .await
                        .map_err(|e| map_sqlx_error("create", e))?;
                    return Ok(CreateOutcome {
                        task: existing,
                        created: false,
                    });
                }
                // Live key whose task was already cleaned up: take it over.
                sqlx::query(
                    "UPDATE task_idempotency_keys SET task_id = $2, expires_at = $3 \
                     WHERE idempotency_key = $1",
                )
                .bind(key)
                .bind(task.id.as_uuid())
                .bind(expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("reserve_idempotency_key", e))?;
            }
        }

        insert_task(&mut tx, &task).await?;
        insert_event(&mut tx, &Transition::created(&task).into_event(task.id, now)).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create", e))?;

        Ok(CreateOutcome {
            task,
            created: true,
        })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(skip(self, spec), fields(kind = %spec.kind), err)]
    async fn create(&self, spec: NewTask) -> Result<CreateOutcome, TaskError> {
        spec.validate()?;
        let key = spec.idempotency_key.clone();

        match self.create_inner(spec).await {
            Err(err) if err.is_conflict() && key.is_some() => {
                // Lost the unique-key race: return the winner.
                let key = key.unwrap_or_default();
                let mut tx = self.begin().await?;
                let existing = lookup_key(&mut tx, &key).await?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("create", e))?;
                match existing {
                    Some(task) => Ok(CreateOutcome {
                        task,
                        created: false,
                    }),
                    None => Err(err),
                }
            }
            other => other,
        }
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        fetch_task(&*self.pool, id).await
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskError> {
        let sql = concat!(
            "SELECT ",
            task_columns!(),
            " FROM tasks \
              WHERE (cardinality($1::text[]) = 0 OR status = ANY($1)) \
                AND ($2::text IS NULL OR kind = $2) \
                AND ($3::timestamptz IS NULL OR created_at >= $3) \
                AND ($4::timestamptz IS NULL OR created_at <= $4) \
              ORDER BY created_at DESC, id DESC \
              LIMIT $5 OFFSET $6"
        );
        let rows = sqlx::query(sql)
            .bind(status_params(filter))
            .bind(filter.kind.as_deref())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(pagination.limit as i64)
            .bind(pagination.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn count(&self, filter: &TaskFilter) -> Result<u64, TaskError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tasks
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            "#,
        )
        .bind(status_params(filter))
        .bind(filter.kind.as_deref())
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;

        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn events(&self, id: TaskId) -> Result<Vec<TaskEvent>, TaskError> {
        let events = fetch_events(&*self.pool, id).await?;
        if events.is_empty() && fetch_task(&*self.pool, id).await?.is_none() {
            return Err(TaskError::not_found(format!("task {id}")));
        }
        Ok(events)
    }

    #[instrument(skip(self, update), err)]
    async fn update_progress(
        &self,
        id: TaskId,
        update: &ProgressUpdate,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        self.mutate("update_progress", id, pre, |task, now| {
            task.apply_progress(update, now)?;
            Ok(None)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn heartbeat(&self, id: TaskId, pre: Precondition) -> Result<Task, TaskError> {
        self.mutate("heartbeat", id, pre, |task, now| {
            task.record_heartbeat(now)?;
            Ok(None)
        })
        .await
    }

    #[instrument(skip(self, result, usage_metrics), err)]
    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        usage_metrics: Option<JsonValue>,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate("complete", id, pre, move |task, now| {
            task.complete(result, usage_metrics, retention, now).map(Some)
        })
        .await
    }

    #[instrument(skip(self, policy), fields(code = %failure.code), err)]
    async fn fail(
        &self,
        id: TaskId,
        failure: &TaskFailure,
        policy: &RetryPolicy,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate("fail", id, pre, |task, now| {
            let decision =
                policy.decide(task.attempt_count, task.max_attempts, failure.retryable, now);
            task.fail(failure, &decision, retention, now).map(Some)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn cancel(
        &self,
        id: TaskId,
        reason: Option<&str>,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate("cancel", id, pre, |task, now| {
            task.cancel(reason, retention, now).map(Some)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn mark_notified(&self, id: TaskId) -> Result<Task, TaskError> {
        self.mutate("mark_notified", id, Precondition::none(), |task, now| {
            task.mark_notified(now)?;
            Ok(None)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn cleanup_expired(&self, batch_size: u32) -> Result<u64, TaskError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let deleted: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH doomed AS (
                SELECT id AS doomed_id
                FROM tasks
                WHERE status IN ('completed', 'failed', 'cancelled')
                  AND expires_at <= $1
                ORDER BY expires_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM tasks
            USING doomed
            WHERE tasks.id = doomed.doomed_id
            RETURNING tasks.id
            "#,
        )
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cleanup_expired", e))?;

        sqlx::query(
            "DELETE FROM task_idempotency_keys WHERE expires_at <= $1 OR task_id = ANY($2)",
        )
        .bind(now)
        .bind(&deleted)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cleanup_expired", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cleanup_expired", e))?;

        debug!(deleted = deleted.len(), "expired tasks removed");
        Ok(deleted.len() as u64)
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError> {
        self.claim_from(id, TaskStatus::Pending, worker).await
    }

    #[instrument(skip(self), err)]
    async fn claim_retry(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError> {
        self.claim_from(id, TaskStatus::Retrying, worker).await
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()), err)]
    async fn claim_batch(
        &self,
        limit: u32,
        exclude: &[TaskId],
        worker: &WorkerId,
    ) -> Result<Vec<Task>, TaskError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let excluded: Vec<Uuid> = exclude.iter().map(|id| *id.as_uuid()).collect();
        let mut tx = self.begin().await?;

        let sql = concat!(
            "WITH candidates AS ( \
                SELECT id AS candidate_id \
                FROM tasks \
                WHERE status = 'pending' \
                  AND attempt_count < max_attempts \
                  AND NOT (id = ANY($1)) \
                ORDER BY priority DESC, created_at ASC \
                LIMIT $4 \
                FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE tasks SET ",
            claim_set!(),
            " FROM candidates \
              WHERE tasks.id = candidates.candidate_id AND tasks.status = 'pending' \
              RETURNING ",
            task_columns!()
        );
        let rows = sqlx::query(sql)
            .bind(&excluded)
            .bind(now)
            .bind(worker.as_str())
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        for task in &claimed {
            let event = Transition::claimed(TaskStatus::Pending, task).into_event(task.id, now);
            insert_event(&mut tx, &event).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;
        Ok(claimed)
    }

    #[instrument(skip(self), err)]
    async fn find_stale_running(
        &self,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<Task>, TaskError> {
        let cutoff = self.clock.now() - chrono_duration(timeout);
        let sql = concat!(
            "SELECT ",
            task_columns!(),
            " FROM tasks \
              WHERE status = 'running' \
                AND COALESCE(last_heartbeat_at, started_at, updated_at) < $1 \
              ORDER BY COALESCE(last_heartbeat_at, started_at, updated_at) ASC \
              LIMIT $2"
        );
        let rows = sqlx::query(sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_stale_running", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Task>, TaskError> {
        let sql = concat!(
            "SELECT ",
            task_columns!(),
            " FROM tasks \
              WHERE status = 'retrying' \
                AND (next_retry_at IS NULL OR next_retry_at <= $1) \
              ORDER BY next_retry_at ASC NULLS FIRST \
              LIMIT $2"
        );
        let rows = sqlx::query(sql)
            .bind(self.clock.now())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_ready_for_retry", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue(&self, id: TaskId) -> Result<Task, TaskError> {
        self.mutate("requeue", id, Precondition::none(), |task, now| {
            task.requeue(now).map(Some)
        })
        .await
    }
}

#[async_trait]
impl DeadLetterStore for PostgresTaskStore {
    #[instrument(skip(self, failure_history), err)]
    async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        failure_history: Option<Vec<FailureEntry>>,
    ) -> Result<DeadLetterRecord, TaskError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let current = lock_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| TaskError::not_found(format!("task {task_id}")))?;

        if let Some(existing) = fetch_dead_letter_for_task(&mut tx, task_id).await? {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;
            return Ok(existing);
        }

        let history = match failure_history {
            Some(history) => history,
            None => failure_history_from_events(&fetch_events(&mut *tx, task_id).await?),
        };

        let mut next = current.clone();
        let transition = next.mark_dead_lettered(self.settings.retention, now)?;
        write_guarded(&mut tx, &next, current.version, current.status).await?;
        insert_event(&mut tx, &transition.into_event(task_id, now)).await?;

        let record = DeadLetterRecord::new(next, history, now);
        let snapshot = to_json(&record.task)?;
        let history = to_json(&record.failure_history)?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, task_id, task_snapshot, failure_history, moved_at,
                                      requeued_at, requeue_count, last_requeued_task_id)
            VALUES ($1, $2, $3, $4, $5, NULL, 0, NULL)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(task_id.as_uuid())
        .bind(snapshot)
        .bind(history)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;
        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<Task, TaskError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?
            .ok_or_else(|| TaskError::not_found(format!("dead letter {id}")))?;
        let record = dead_letter_from_row(&row)?;

        if let Some(previous_id) = record.last_requeued_task_id {
            if let Some(previous) = fetch_task(&mut *tx, previous_id).await? {
                if !previous.status.is_terminal() {
                    tx.commit()
                        .await
                        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
                    return Ok(previous);
                }
            }
        }

        let spec = record.requeue_spec();
        spec.validate()?;
        let task = Task::new(spec, now);
        insert_task(&mut tx, &task).await?;
        insert_event(&mut tx, &Transition::created(&task).into_event(task.id, now)).await?;

        sqlx::query(
            r#"
            UPDATE dead_letters
            SET requeue_count = requeue_count + 1,
                requeued_at = $2,
                last_requeued_task_id = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .bind(task.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(task)
    }

    #[instrument(skip(self), err)]
    async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, TaskError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterRecord>, TaskError> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters \
             ORDER BY moved_at ASC, id ASC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(pagination.limit as i64)
            .bind(pagination.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), TaskError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found(format!("dead letter {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn dead_letter_stats(&self) -> Result<DeadLetterStats, TaskError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE requeue_count = 0) AS pending,
                COUNT(*) FILTER (WHERE requeue_count > 0) AS requeued
            FROM dead_letters
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;

        let read = |column: &str| -> Result<u64, TaskError> {
            row.try_get::<i64, _>(column)
                .map(|n| n.max(0) as u64)
                .map_err(|e| map_sqlx_error("dead_letter_stats", e))
        };
        Ok(DeadLetterStats {
            total: read("total")?,
            pending: read("pending")?,
            requeued: read("requeued")?,
        })
    }
}

async fn fetch_task<'e, E>(executor: E, id: TaskId) -> Result<Option<Task>, TaskError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(concat!("SELECT ", task_columns!(), " FROM tasks WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

    row.as_ref().map(task_from_row).transpose()
}

async fn lock_task(
    tx: &mut Transaction<'_, Postgres>,
    id: TaskId,
) -> Result<Option<Task>, TaskError> {
    let row = sqlx::query(concat!(
        "SELECT ",
        task_columns!(),
        " FROM tasks WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_task", e))?;

    row.as_ref().map(task_from_row).transpose()
}

async fn fetch_events<'e, E>(executor: E, id: TaskId) -> Result<Vec<TaskEvent>, TaskError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!("SELECT {EVENT_COLUMNS} FROM task_events WHERE task_id = $1 ORDER BY seq ASC");
    let rows = sqlx::query(&sql)
        .bind(id.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error("events", e))?;

    rows.iter()
        .map(|row| {
            TaskEventRow::from_row(row)
                .map_err(|e| TaskError::storage(format!("failed to deserialize event row: {e}")))
                .and_then(TaskEvent::try_from)
        })
        .collect()
}

async fn lookup_key(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
) -> Result<Option<Task>, TaskError> {
    let owner: Option<Uuid> = sqlx::query_scalar(
        "SELECT task_id FROM task_idempotency_keys WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lookup_idempotency_key", e))?;

    match owner {
        Some(task_id) => fetch_task(&mut **tx, TaskId::from_uuid(task_id)).await,
        None => Ok(None),
    }
}

async fn fetch_dead_letter_for_task(
    tx: &mut Transaction<'_, Postgres>,
    task_id: TaskId,
) -> Result<Option<DeadLetterRecord>, TaskError> {
    let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE task_id = $1");
    let row = sqlx::query(&sql)
        .bind(task_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_dead_letter", e))?;

    row.as_ref().map(dead_letter_from_row).transpose()
}

async fn insert_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<(), TaskError> {
    sqlx::query(concat!(
        "INSERT INTO tasks (",
        task_columns!(),
        ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
           $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32)"
    ))
    .bind(task.id.as_uuid())
    .bind(&task.kind)
    .bind(task.input_params.clone())
    .bind(task.status.as_str())
    .bind(task.version as i64)
    .bind(task.attempt_count as i32)
    .bind(task.max_attempts as i32)
    .bind(task.next_retry_at)
    .bind(task.last_error.as_deref())
    .bind(task.is_retryable)
    .bind(task.progress_percent as i16)
    .bind(task.progress_message.as_deref())
    .bind(task.current_step.as_deref())
    .bind(task.total_steps.map(|n| n as i32))
    .bind(task.current_step_num.map(|n| n as i32))
    .bind(task.result.clone())
    .bind(task.usage_metrics.clone())
    .bind(task.error_message.as_deref())
    .bind(task.error_code.as_deref())
    .bind(task.idempotency_key.as_deref())
    .bind(task.started_at)
    .bind(task.last_heartbeat_at)
    .bind(task.worker_id.as_deref())
    .bind(task.webhook_url.as_deref())
    .bind(task.notification_sent_at)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(task.expires_at)
    .bind(task.dead_lettered_at)
    .bind(task.priority)
    .bind(task.metadata.clone())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_task", e))?;
    Ok(())
}

/// Persist every mutable column, but only if the row is still at the
/// version and status the transition was computed from.
async fn write_guarded(
    tx: &mut Transaction<'_, Postgres>,
    task: &Task,
    expected_version: u64,
    expected_status: TaskStatus,
) -> Result<(), TaskError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET
            status = $4,
            version = $5,
            attempt_count = $6,
            next_retry_at = $7,
            last_error = $8,
            is_retryable = $9,
            progress_percent = $10,
            progress_message = $11,
            current_step = $12,
            total_steps = $13,
            current_step_num = $14,
            result = $15,
            usage_metrics = $16,
            error_message = $17,
            error_code = $18,
            started_at = $19,
            last_heartbeat_at = $20,
            worker_id = $21,
            notification_sent_at = $22,
            updated_at = $23,
            completed_at = $24,
            expires_at = $25,
            dead_lettered_at = $26,
            metadata = $27
        WHERE id = $1 AND version = $2 AND status = $3
        "#,
    )
    .bind(task.id.as_uuid())
    .bind(expected_version as i64)
    .bind(expected_status.as_str())
    .bind(task.status.as_str())
    .bind(task.version as i64)
    .bind(task.attempt_count as i32)
    .bind(task.next_retry_at)
    .bind(task.last_error.as_deref())
    .bind(task.is_retryable)
    .bind(task.progress_percent as i16)
    .bind(task.progress_message.as_deref())
    .bind(task.current_step.as_deref())
    .bind(task.total_steps.map(|n| n as i32))
    .bind(task.current_step_num.map(|n| n as i32))
    .bind(task.result.clone())
    .bind(task.usage_metrics.clone())
    .bind(task.error_message.as_deref())
    .bind(task.error_code.as_deref())
    .bind(task.started_at)
    .bind(task.last_heartbeat_at)
    .bind(task.worker_id.as_deref())
    .bind(task.notification_sent_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(task.expires_at)
    .bind(task.dead_lettered_at)
    .bind(task.metadata.clone())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_task", e))?;

    if result.rows_affected() == 0 {
        return Err(TaskError::conflict(format!(
            "task {} changed concurrently (expected version {expected_version}, status {expected_status})",
            task.id
        )));
    }
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &TaskEvent,
) -> Result<(), TaskError> {
    let sql = format!(
        "INSERT INTO task_events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
    );
    sqlx::query(&sql)
        .bind(event.id.as_uuid())
        .bind(event.task_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(event.previous_status.map(|s| s.as_str()))
        .bind(event.new_status.as_str())
        .bind(event.event_data.clone())
        .bind(event.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;
    Ok(())
}

fn status_params(filter: &TaskFilter) -> Vec<String> {
    filter
        .statuses
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, TaskError> {
    serde_json::to_value(value)
        .map_err(|e| TaskError::storage(format!("failed to serialize dead letter: {e}")))
}

/// Map SQLx errors to TaskError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation: lost an insert race.
                Some("23505") => TaskError::Conflict(msg),
                // Check violation: e.g. attempt_count would exceed max_attempts.
                Some("23514") => TaskError::Conflict(msg),
                _ => TaskError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TaskError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            TaskError::Storage(format!("unexpected row not found in {operation}"))
        }
        _ => TaskError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: Uuid,
    kind: String,
    input_params: JsonValue,
    status: String,
    version: i64,
    attempt_count: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    is_retryable: bool,
    progress_percent: i16,
    progress_message: Option<String>,
    current_step: Option<String>,
    total_steps: Option<i32>,
    current_step_num: Option<i32>,
    result: Option<JsonValue>,
    usage_metrics: Option<JsonValue>,
    error_message: Option<String>,
    error_code: Option<String>,
    idempotency_key: Option<String>,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    webhook_url: Option<String>,
    notification_sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    priority: i32,
    metadata: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            input_params: row.try_get("input_params")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            is_retryable: row.try_get("is_retryable")?,
            progress_percent: row.try_get("progress_percent")?,
            progress_message: row.try_get("progress_message")?,
            current_step: row.try_get("current_step")?,
            total_steps: row.try_get("total_steps")?,
            current_step_num: row.try_get("current_step_num")?,
            result: row.try_get("result")?,
            usage_metrics: row.try_get("usage_metrics")?,
            error_message: row.try_get("error_message")?,
            error_code: row.try_get("error_code")?,
            idempotency_key: row.try_get("idempotency_key")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            worker_id: row.try_get("worker_id")?,
            webhook_url: row.try_get("webhook_url")?,
            notification_sent_at: row.try_get("notification_sent_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            expires_at: row.try_get("expires_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            priority: row.try_get("priority")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            kind: row.kind,
            input_params: row.input_params,
            status: row.status.parse()?,
            version: row.version.max(0) as u64,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            is_retryable: row.is_retryable,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            progress_message: row.progress_message,
            current_step: row.current_step,
            total_steps: row.total_steps.map(|n| n.max(0) as u32),
            current_step_num: row.current_step_num.map(|n| n.max(0) as u32),
            result: row.result,
            usage_metrics: row.usage_metrics,
            error_message: row.error_message,
            error_code: row.error_code,
            idempotency_key: row.idempotency_key,
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
            worker_id: row.worker_id,
            webhook_url: row.webhook_url,
            notification_sent_at: row.notification_sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            dead_lettered_at: row.dead_lettered_at,
            priority: row.priority,
            metadata: row.metadata,
        })
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, TaskError> {
    TaskRow::from_row(row)
        .map_err(|e| TaskError::storage(format!("failed to deserialize task row: {e}")))
        .and_then(Task::try_from)
}

#[derive(Debug)]
struct TaskEventRow {
    id: Uuid,
    task_id: Uuid,
    event_type: String,
    previous_status: Option<String>,
    new_status: String,
    event_data: JsonValue,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskEventRow {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            event_type: row.try_get("event_type")?,
            previous_status: row.try_get("previous_status")?,
            new_status: row.try_get("new_status")?,
            event_data: row.try_get("event_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<TaskEventRow> for TaskEvent {
    type Error = TaskError;

    fn try_from(row: TaskEventRow) -> Result<Self, Self::Error> {
        Ok(TaskEvent {
            id: EventId::from_uuid(row.id),
            task_id: TaskId::from_uuid(row.task_id),
            event_type: row.event_type.parse()?,
            previous_status: row.previous_status.map(|s| s.parse()).transpose()?,
            new_status: row.new_status.parse()?,
            event_data: row.event_data,
            created_at: row.created_at,
        })
    }
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterRecord, TaskError> {
    let read = |e: sqlx::Error| TaskError::storage(format!("failed to deserialize dead letter row: {e}"));
    let decode = |e: serde_json::Error| TaskError::storage(format!("corrupt dead letter payload: {e}"));

    let id: Uuid = row.try_get("id").map_err(read)?;
    let snapshot: JsonValue = row.try_get("task_snapshot").map_err(read)?;
    let history: JsonValue = row.try_get("failure_history").map_err(read)?;
    let requeue_count: i32 = row.try_get("requeue_count").map_err(read)?;
    let last_requeued: Option<Uuid> = row.try_get("last_requeued_task_id").map_err(read)?;

    Ok(DeadLetterRecord {
        id: DeadLetterId::from_uuid(id),
        task: serde_json::from_value(snapshot).map_err(decode)?,
        failure_history: serde_json::from_value(history).map_err(decode)?,
        moved_at: row.try_get("moved_at").map_err(read)?,
        requeued_at: row.try_get("requeued_at").map_err(read)?,
        requeue_count: requeue_count.max(0) as u32,
        last_requeued_task_id: last_requeued.map(TaskId::from_uuid),
    })
}
