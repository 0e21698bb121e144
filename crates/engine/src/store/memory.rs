use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use forgetask_core::{DeadLetterId, TaskId};

use super::{StoreSettings, TaskStore};
use crate::clock::{Clock, SystemClock, chrono_duration};
use crate::dead_letter::{
    DeadLetterRecord, DeadLetterStats, DeadLetterStore, FailureEntry, failure_history_from_events,
};
use crate::error::TaskError;
use crate::idempotency::IdempotencyIndex;
use crate::retry::RetryPolicy;
use crate::task::{
    CreateOutcome, NewTask, Pagination, Precondition, ProgressUpdate, Task, TaskEvent,
    TaskFailure, TaskFilter, TaskStatus, Transition, WorkerId,
};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    events: HashMap<TaskId, Vec<TaskEvent>>,
    idempotency: IdempotencyIndex,
    dead_letters: HashMap<DeadLetterId, DeadLetterRecord>,
    dead_letter_by_task: HashMap<TaskId, DeadLetterId>,
}

impl State {
    fn task(&self, id: TaskId) -> Result<&Task, TaskError> {
        self.tasks
            .get(&id)
            .ok_or_else(|| TaskError::not_found(format!("task {id}")))
    }

    fn commit(&mut self, task: Task, transition: Option<Transition>, now: DateTime<Utc>) {
        if let Some(transition) = transition {
            self.events
                .entry(task.id)
                .or_default()
                .push(transition.into_event(task.id, now));
        }
        self.tasks.insert(task.id, task);
    }

    fn insert_new(&mut self, task: Task, now: DateTime<Utc>) {
        let created = Transition::created(&task);
        self.commit(task, Some(created), now);
    }

    fn remove_task(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.remove(&id) {
            if let Some(key) = &task.idempotency_key {
                self.idempotency.release(key, id);
            }
        }
        self.events.remove(&id);
    }
}

/// In-memory task store.
///
/// A single lock covers tasks, events, the idempotency index and the
/// dead-letter queue, so every operation is atomic. Intended for tests, dev
/// and single-process deployments.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            settings: StoreSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, TaskError> {
        self.state
            .read()
            .map_err(|_| TaskError::storage("task store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, TaskError> {
        self.state
            .write()
            .map_err(|_| TaskError::storage("task store lock poisoned"))
    }

    /// Apply `f` to a copy of the task under the write lock and commit it
    /// only if both the precondition and the transition succeed.
    fn mutate<F>(&self, id: TaskId, pre: Precondition, f: F) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Task, DateTime<Utc>) -> Result<Option<Transition>, TaskError>,
    {
        let mut state = self.write()?;
        let now = self.clock.now();

        let current = state.task(id)?;
        current.check(&pre)?;
        let mut next = current.clone();
        let transition = f(&mut next, now)?;

        state.commit(next.clone(), transition, now);
        Ok(next)
    }

    fn claim_from(
        &self,
        id: TaskId,
        from: TaskStatus,
        worker: &WorkerId,
    ) -> Result<Task, TaskError> {
        self.mutate(id, Precondition::none(), |task, now| {
            task.claim(from, worker, now).map(Some)
        })
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn create(&self, spec: NewTask) -> Result<CreateOutcome, TaskError> {
        spec.validate()?;

        let mut state = self.write()?;
        let now = self.clock.now();
        let task = Task::new(spec, now);

        if let Some(key) = task.idempotency_key.clone() {
            let expires_at = now + chrono_duration(self.settings.idempotency_window);
            if let Err(existing) = state.idempotency.reserve(&key, task.id, expires_at, now) {
                if let Some(existing) = state.tasks.get(&existing) {
                    return Ok(CreateOutcome {
                        task: existing.clone(),
                        created: false,
                    });
                }
                // Owner was cleaned up; the key is free again.
                state.idempotency.release(&key, existing);
                state
                    .idempotency
                    .reserve(&key, task.id, expires_at, now)
                    .map_err(|holder| {
                        TaskError::storage(format!(
                            "idempotency key '{key}' still bound to task {holder} after release"
                        ))
                    })?;
            }
        }

        state.insert_new(task.clone(), now);
        Ok(CreateOutcome {
            task,
            created: true,
        })
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskError> {
        let state = self.read()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(tasks
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn count(&self, filter: &TaskFilter) -> Result<u64, TaskError> {
        let state = self.read()?;
        Ok(state.tasks.values().filter(|t| filter.matches(t)).count() as u64)
    }

    async fn events(&self, id: TaskId) -> Result<Vec<TaskEvent>, TaskError> {
        let state = self.read()?;
        state.task(id)?;
        Ok(state.events.get(&id).cloned().unwrap_or_default())
    }

    async fn update_progress(
        &self,
        id: TaskId,
        update: &ProgressUpdate,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        self.mutate(id, pre, |task, now| {
            task.apply_progress(update, now)?;
            Ok(None)
        })
    }

    async fn heartbeat(&self, id: TaskId, pre: Precondition) -> Result<Task, TaskError> {
        self.mutate(id, pre, |task, now| {
            task.record_heartbeat(now)?;
            Ok(None)
        })
    }

    async fn complete(
        &self,
        id: TaskId,
        result: JsonValue,
        usage_metrics: Option<JsonValue>,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate(id, pre, |task, now| {
            task.complete(result, usage_metrics, retention, now).map(Some)
        })
    }

    async fn fail(
        &self,
        id: TaskId,
        failure: &TaskFailure,
        policy: &RetryPolicy,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate(id, pre, |task, now| {
            let decision =
                policy.decide(task.attempt_count, task.max_attempts, failure.retryable, now);
            task.fail(failure, &decision, retention, now).map(Some)
        })
    }

    async fn cancel(
        &self,
        id: TaskId,
        reason: Option<&str>,
        pre: Precondition,
    ) -> Result<Task, TaskError> {
        let retention = self.settings.retention;
        self.mutate(id, pre, |task, now| {
            task.cancel(reason, retention, now).map(Some)
        })
    }

    async fn mark_notified(&self, id: TaskId) -> Result<Task, TaskError> {
        self.mutate(id, Precondition::none(), |task, now| {
            task.mark_notified(now)?;
            Ok(None)
        })
    }

    async fn cleanup_expired(&self, batch_size: u32) -> Result<u64, TaskError> {
        let mut state = self.write()?;
        let now = self.clock.now();

        let mut expired: Vec<(DateTime<Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter_map(|t| t.expires_at.filter(|at| *at <= now).map(|at| (at, t.id)))
            .collect();
        expired.sort();
        expired.truncate(batch_size as usize);

        for (_, id) in &expired {
            state.remove_task(*id);
        }
        state.idempotency.purge_expired(now);

        Ok(expired.len() as u64)
    }

    async fn claim(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError> {
        self.claim_from(id, TaskStatus::Pending, worker)
    }

    async fn claim_retry(&self, id: TaskId, worker: &WorkerId) -> Result<Task, TaskError> {
        self.claim_from(id, TaskStatus::Retrying, worker)
    }

    async fn claim_batch(
        &self,
        limit: u32,
        exclude: &[TaskId],
        worker: &WorkerId,
    ) -> Result<Vec<Task>, TaskError> {
        let mut state = self.write()?;
        let now = self.clock.now();
        let exclude: HashSet<TaskId> = exclude.iter().copied().collect();

        let mut candidates: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.attempt_count < t.max_attempts)
            .filter(|t| !exclude.contains(&t.id))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        let ids: Vec<TaskId> = candidates
            .into_iter()
            .take(limit as usize)
            .map(|t| t.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let mut task = state.task(id)?.clone();
            let transition = task.claim(TaskStatus::Pending, worker, now)?;
            state.commit(task.clone(), Some(transition), now);
            claimed.push(task);
        }
        Ok(claimed)
    }

    async fn find_stale_running(
        &self,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<Task>, TaskError> {
        let state = self.read()?;
        let now = self.clock.now();

        let mut stale: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.is_stale(timeout, now))
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.liveness_at());
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Task>, TaskError> {
        let state = self.read()?;
        let now = self.clock.now();

        let mut ready: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.is_due_for_retry(now))
            .cloned()
            .collect();
        ready.sort_by_key(|t| t.next_retry_at);
        ready.truncate(limit as usize);
        Ok(ready)
    }

    async fn requeue(&self, id: TaskId) -> Result<Task, TaskError> {
        self.mutate(id, Precondition::none(), |task, now| {
            task.requeue(now).map(Some)
        })
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryTaskStore {
    async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        failure_history: Option<Vec<FailureEntry>>,
    ) -> Result<DeadLetterRecord, TaskError> {
        let mut state = self.write()?;
        let now = self.clock.now();

        if let Some(existing) = state
            .dead_letter_by_task
            .get(&task_id)
            .and_then(|id| state.dead_letters.get(id))
        {
            return Ok(existing.clone());
        }

        let mut task = state.task(task_id)?.clone();
        let history = match failure_history {
            Some(history) => history,
            None => failure_history_from_events(
                state.events.get(&task_id).map(Vec::as_slice).unwrap_or_default(),
            ),
        };
        let transition = task.mark_dead_lettered(self.settings.retention, now)?;
        state.commit(task.clone(), Some(transition), now);

        let record = DeadLetterRecord::new(task, history, now);
        state.dead_letter_by_task.insert(task_id, record.id);
        state.dead_letters.insert(record.id, record.clone());
        Ok(record)
    }

    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<Task, TaskError> {
        let mut state = self.write()?;
        let now = self.clock.now();

        let record = state
            .dead_letters
            .get(&id)
            .ok_or_else(|| TaskError::not_found(format!("dead letter {id}")))?;

        if let Some(previous) = record
            .last_requeued_task_id
            .and_then(|task_id| state.tasks.get(&task_id))
            .filter(|t| !t.status.is_terminal())
        {
            return Ok(previous.clone());
        }

        let spec = record.requeue_spec();
        spec.validate()?;
        let task = Task::new(spec, now);
        state.insert_new(task.clone(), now);

        if let Some(record) = state.dead_letters.get_mut(&id) {
            record.record_requeue(task.id, now);
        }
        Ok(task)
    }

    async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterRecord>, TaskError> {
        Ok(self.read()?.dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterRecord>, TaskError> {
        let state = self.read()?;
        let mut records: Vec<DeadLetterRecord> = state.dead_letters.values().cloned().collect();
        records.sort_by_key(|r| (r.moved_at, r.id));

        Ok(records
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), TaskError> {
        let mut state = self.write()?;
        let record = state
            .dead_letters
            .remove(&id)
            .ok_or_else(|| TaskError::not_found(format!("dead letter {id}")))?;
        state.dead_letter_by_task.remove(&record.task.id);
        Ok(())
    }

    async fn dead_letter_stats(&self) -> Result<DeadLetterStats, TaskError> {
        let state = self.read()?;
        Ok(DeadLetterStats::from_records(state.dead_letters.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::task::{FailureCategory, TaskEventType};
    use serde_json::json;

    fn store() -> (Arc<ManualClock>, InMemoryTaskStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryTaskStore::with_clock(clock.clone());
        (clock, store)
    }

    fn transient() -> TaskFailure {
        TaskFailure::new("upstream timeout", "TRANSIENT_ERROR", true, FailureCategory::Transient)
    }

    fn worker() -> WorkerId {
        WorkerId::new("test-worker")
    }

    #[tokio::test]
    async fn create_logs_created_event() {
        let (_, store) = store();
        let outcome = store.create(NewTask::new("k", json!({"a": 1}))).await.unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.task.status, TaskStatus::Pending);
        assert_eq!(outcome.task.version, 1);

        let events = store.events(outcome.task.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TaskEventType::Created);
        assert_eq!(events[0].previous_status, None);
    }

    #[tokio::test]
    async fn idempotent_create_returns_original() {
        let (_, store) = store();
        let first = store
            .create(NewTask::new("k", json!({"v": 1})).with_idempotency_key("k1"))
            .await
            .unwrap();
        let second = store
            .create(NewTask::new("k", json!({"v": 2})).with_idempotency_key("k1"))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.task.id, first.task.id);
        assert_eq!(second.task.input_params, json!({"v": 1}));
        assert_eq!(store.count(&TaskFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_expires_after_window() {
        let (clock, store) = store();
        let first = store
            .create(NewTask::new("k", json!({})).with_idempotency_key("k1"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(25 * 3600));
        let second = store
            .create(NewTask::new("k", json!({})).with_idempotency_key("k1"))
            .await
            .unwrap();

        assert!(second.created);
        assert_ne!(second.task.id, first.task.id);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (_, store) = store();
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;

        let claimed = store.claim(task.id, &worker()).await.unwrap();
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.version, 2);

        let err = store.claim(task.id, &worker()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.claim(TaskId::new(), &worker()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stale_attempt_write_is_rejected() {
        let (_, store) = store();
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        store.claim(task.id, &worker()).await.unwrap();

        let err = store
            .complete(task.id, json!(1), None, Precondition::attempt(2))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let done = store
            .complete(task.id, json!(1), None, Precondition::attempt(1))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn claim_batch_orders_by_priority_then_age() {
        let (clock, store) = store();
        let low = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        clock.advance(Duration::from_secs(1));
        let high = store
            .create(NewTask::new("k", json!({})).with_priority(10))
            .await
            .unwrap()
            .task;
        clock.advance(Duration::from_secs(1));
        let newer_low = store.create(NewTask::new("k", json!({}))).await.unwrap().task;

        let claimed = store.claim_batch(2, &[], &worker()).await.unwrap();
        let ids: Vec<TaskId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);

        let rest = store.claim_batch(10, &[newer_low.id], &worker()).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn failure_schedules_retry_then_requeue() {
        let (clock, store) = store();
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        store.claim(task.id, &worker()).await.unwrap();

        let failed = store
            .fail(task.id, &transient(), &RetryPolicy::default(), Precondition::attempt(1))
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Retrying);
        assert!(store.find_ready_for_retry(10).await.unwrap().is_empty());
        assert!(store.requeue(task.id).await.unwrap_err().is_conflict());

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.find_ready_for_retry(10).await.unwrap().len(), 1);

        let requeued = store.requeue(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(store.requeue(task.id).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn stale_running_tasks_are_found() {
        let (clock, store) = store();
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        store.claim(task.id, &worker()).await.unwrap();

        let timeout = Duration::from_secs(120);
        assert!(store.find_stale_running(timeout, 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(121));
        assert_eq!(store.find_stale_running(timeout, 10).await.unwrap().len(), 1);

        store.heartbeat(task.id, Precondition::none()).await.unwrap();
        assert!(store.find_stale_running(timeout, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_of_cleaned_up_task_can_be_reused() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryTaskStore::with_clock(clock.clone()).with_settings(StoreSettings {
            retention: Duration::from_secs(3600),
            ..StoreSettings::default()
        });
        let first = store
            .create(NewTask::new("k", json!({})).with_idempotency_key("nightly"))
            .await
            .unwrap()
            .task;
        store
            .cancel(first.id, None, Precondition::none())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(store.cleanup_expired(100).await.unwrap(), 1);

        let second = store
            .create(NewTask::new("k", json!({})).with_idempotency_key("nightly"))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.task.id, first.id);

        let third = store
            .create(NewTask::new("k", json!({})).with_idempotency_key("nightly"))
            .await
            .unwrap();
        assert!(!third.created);
        assert_eq!(third.task.id, second.task.id);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_terminal_tasks() {
        let (clock, store) = store();
        let done = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        store.claim(done.id, &worker()).await.unwrap();
        store
            .complete(done.id, json!(1), None, Precondition::none())
            .await
            .unwrap();
        let pending = store.create(NewTask::new("k", json!({}))).await.unwrap().task;

        assert_eq!(store.cleanup_expired(100).await.unwrap(), 0);

        clock.advance(Duration::from_secs(8 * 24 * 3600));
        assert_eq!(store.cleanup_expired(100).await.unwrap(), 1);
        assert!(store.get(done.id).await.unwrap().is_none());
        assert!(store.get(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let (_, store) = store();
        let task = store
            .create(NewTask::new("k", json!({"x": 1})).with_max_attempts(1))
            .await
            .unwrap()
            .task;
        store.claim(task.id, &worker()).await.unwrap();
        store
            .fail(task.id, &transient(), &RetryPolicy::default(), Precondition::attempt(1))
            .await
            .unwrap();

        let record = store.move_to_dead_letter(task.id, None).await.unwrap();
        assert_eq!(record.failure_history.len(), 1);
        assert_eq!(
            store.move_to_dead_letter(task.id, None).await.unwrap().id,
            record.id
        );

        let fresh = store.requeue_dead_letter(record.id).await.unwrap();
        assert_ne!(fresh.id, task.id);
        assert_eq!(fresh.attempt_count, 0);
        assert_eq!(fresh.metadata["dead_letter_id"], json!(record.id));

        // Still pending: the same task comes back.
        let again = store.requeue_dead_letter(record.id).await.unwrap();
        assert_eq!(again.id, fresh.id);

        let record = store.get_dead_letter(record.id).await.unwrap().unwrap();
        assert_eq!(record.requeue_count, 1);
        assert_eq!(store.dead_letter_stats().await.unwrap().requeued, 1);

        store.delete_dead_letter(record.id).await.unwrap();
        assert!(store.get_dead_letter(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_task_cannot_be_dead_lettered() {
        let (_, store) = store();
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        store.claim(task.id, &worker()).await.unwrap();

        let err = store.move_to_dead_letter(task.id, None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(task.id, &WorkerId::new(format!("w{i}"))).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().version, 2);
    }
}
