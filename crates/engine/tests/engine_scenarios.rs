use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio_stream::StreamExt;

use forgetask_engine::{
    EngineConfig, ExecutionContext, ExecutionError, ExecutionOutput, ExecutorRegistry,
    InMemoryTaskStore, ManualClock, NoopNotifier, RetryPolicy, StreamConfig, StreamEvent,
    SubmitRequest, TaskEngine, TaskEventType, TaskId, TaskStatus, TaskStore, TerminalHooks,
    WorkerPool, WorkerPoolConfig,
};

fn test_config() -> EngineConfig {
    EngineConfig {
        pool: WorkerPoolConfig::default().with_heartbeat_interval(Duration::from_millis(50)),
        stream: StreamConfig {
            poll_interval: Duration::from_millis(10),
            ..StreamConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn engine_with_clock(
    registry: ExecutorRegistry,
) -> (TaskEngine, Arc<InMemoryTaskStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
    let engine = TaskEngine::new(store.clone(), registry, Arc::new(NoopNotifier), test_config());
    (engine, store, clock)
}

#[tokio::test]
async fn retryable_failures_exhaust_max_attempts() {
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("flaky", |_ctx: ExecutionContext| async move {
        Err::<ExecutionOutput, _>(ExecutionError::transient("upstream timed out"))
    });
    let (engine, _store, clock) = engine_with_clock(registry);

    let task = engine
        .submit(SubmitRequest::new("flaky", json!({})).max_attempts(2))
        .await
        .unwrap()
        .task;
    engine.pool().wait_idle().await;

    let first = engine.get(task.id).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Retrying);
    assert_eq!(first.attempt_count, 1);
    assert!(first.next_retry_at.is_some());

    // Not due yet: the scan leaves it alone.
    let report = engine.recovery_scanner().scan_once().await;
    assert_eq!(report.retries_requeued, 0);

    clock.advance(Duration::from_secs(10));
    let report = engine.recovery_scanner().scan_once().await;
    assert_eq!(report.retries_requeued, 1);
    engine.pool().wait_idle().await;

    let last = engine.get(task.id).await.unwrap().unwrap();
    assert_eq!(last.status, TaskStatus::Failed);
    assert_eq!(last.attempt_count, 2);
    assert_eq!(last.error_message.as_deref(), Some("upstream timed out"));
    assert!(last.next_retry_at.is_none());
    assert!(last.result.is_none());
}

#[tokio::test]
async fn duplicate_key_returns_original_task() {
    let (engine, _store, _clock) = engine_with_clock(ExecutorRegistry::new());
    engine.pool().shutdown(Duration::from_millis(10)).await;

    let first = engine
        .submit(SubmitRequest::new("report.generate", json!({"month": 1})).idempotency_key("k1"))
        .await
        .unwrap();
    let second = engine
        .submit(SubmitRequest::new("report.generate", json!({"month": 2})).idempotency_key("k1"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.task.id, first.task.id);
    assert_eq!(second.task.input_params, json!({"month": 1}));
    assert_eq!(second.task.version, first.task.version);
}

#[tokio::test]
async fn idempotency_key_expires_after_window() {
    let (engine, _store, clock) = engine_with_clock(ExecutorRegistry::new());
    engine.pool().shutdown(Duration::from_millis(10)).await;

    let first = engine
        .submit(SubmitRequest::new("k", json!({})).idempotency_key("nightly"))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(24 * 3600 + 1));
    let second = engine
        .submit(SubmitRequest::new("k", json!({})).idempotency_key("nightly"))
        .await
        .unwrap();

    assert!(second.created);
    assert_ne!(second.task.id, first.task.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_pools_execute_each_task_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    let runs: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::default();

    let pools: Vec<WorkerPool> = (0..2)
        .map(|n| {
            let runs = runs.clone();
            let mut registry = ExecutorRegistry::new();
            registry.register_fn("*", move |ctx: ExecutionContext| {
                let runs = runs.clone();
                async move {
                    *runs.lock().unwrap().entry(ctx.task_id).or_default() += 1;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok::<_, ExecutionError>(ExecutionOutput::new(json!(null)))
                }
            });
            WorkerPool::new(
                store.clone(),
                registry,
                RetryPolicy::default(),
                TerminalHooks::new(store.clone(), Arc::new(NoopNotifier)),
                WorkerPoolConfig::default()
                    .with_size(3)
                    .with_worker_id(forgetask_engine::WorkerId::new(format!("pool-{n}"))),
            )
        })
        .collect();

    let mut ids = Vec::new();
    for i in 0..20 {
        let task = store
            .create(forgetask_engine::NewTask::new("job", json!({"i": i})))
            .await
            .unwrap()
            .task;
        ids.push(task.id);
    }
    // Both pools also race on direct dispatch of the same ids.
    for id in &ids {
        for pool in &pools {
            pool.enqueue(*id);
        }
    }
    for _ in 0..20 {
        for pool in &pools {
            pool.poll_pending().await.unwrap();
        }
        for pool in &pools {
            pool.wait_idle().await;
        }
    }

    let runs = runs.lock().unwrap().clone();
    for id in &ids {
        assert_eq!(runs.get(id), Some(&1), "task {id} ran {:?} times", runs.get(id));
        let task = store.get(*id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 1);
    }
    let claimed: u64 = pools.iter().map(|p| p.stats().tasks_claimed).sum();
    assert_eq!(claimed, 20);
}

#[tokio::test]
async fn crashed_worker_task_is_recovered_and_rerun() {
    let (engine, store, clock) = engine_with_clock(ExecutorRegistry::new());
    engine.pool().shutdown(Duration::from_millis(10)).await;

    let task = engine
        .submit(SubmitRequest::new("report.generate", json!({})))
        .await
        .unwrap()
        .task;
    // A worker in another process claims it and dies.
    store
        .claim(task.id, &forgetask_engine::WorkerId::new("crashed"))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(121));
    let report = engine.recovery_scanner().scan_once().await;
    assert_eq!(report.stale_retried, 1);

    let stale = engine.get(task.id).await.unwrap().unwrap();
    assert_eq!(stale.status, TaskStatus::Retrying);
    assert!(stale.error_code.is_none());
    assert!(stale.last_error.unwrap().contains("heartbeat"));

    // A fresh engine (new process) picks the retry up.
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("report.generate", |ctx: ExecutionContext| async move {
        Ok::<_, ExecutionError>(ExecutionOutput::new(json!({"attempt": ctx.attempt})))
    });
    let fresh = TaskEngine::new(store.clone(), registry, Arc::new(NoopNotifier), test_config());
    clock.advance(Duration::from_secs(10));
    fresh.recovery_scanner().scan_once().await;
    fresh.pool().wait_idle().await;

    let done = fresh.get(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"attempt": 2})));

    let events: Vec<TaskEventType> = fresh
        .events(task.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            TaskEventType::Created,
            TaskEventType::Claimed,
            TaskEventType::RetryScheduled,
            TaskEventType::Requeued,
            TaskEventType::Claimed,
            TaskEventType::Completed,
        ]
    );
}

#[tokio::test]
async fn progress_stream_follows_execution() {
    let gate = Arc::new(Notify::new());
    let mut registry = ExecutorRegistry::new();
    let release = gate.clone();
    registry.register_fn("render", move |ctx: ExecutionContext| {
        let release = release.clone();
        async move {
            ctx.progress.percent(25).await.ok();
            ctx.progress.percent(50).await.ok();
            release.notified().await;
            ctx.progress.percent(90).await.ok();
            Ok::<_, ExecutionError>(ExecutionOutput::new(json!({"pages": 3})))
        }
    });
    let (engine, _store, _clock) = engine_with_clock(registry);

    let task = engine
        .submit(SubmitRequest::new("render", json!({})))
        .await
        .unwrap()
        .task;
    let mut stream = engine.stream(task.id);

    let mut seen = Vec::new();
    let mut released = false;
    let last = loop {
        let event = stream.next().await.unwrap();
        match &event {
            StreamEvent::Progress(snapshot) => {
                seen.push(snapshot.progress_percent);
                if snapshot.progress_percent >= 50 && !released {
                    gate.notify_one();
                    released = true;
                }
            }
            StreamEvent::Heartbeat(_) => {}
            _ => break event,
        }
    };

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    match last {
        StreamEvent::Complete(snapshot) => {
            assert_eq!(snapshot.status, TaskStatus::Completed);
            assert_eq!(snapshot.progress_percent, 100);
            assert_eq!(snapshot.result, Some(json!({"pages": 3})));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn cancelled_task_ends_stream_and_drops_result() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let mut registry = ExecutorRegistry::new();
    let (signal, release) = (started.clone(), gate.clone());
    registry.register_fn("slow", move |_ctx: ExecutionContext| {
        let (signal, release) = (signal.clone(), release.clone());
        async move {
            signal.notify_one();
            release.notified().await;
            Ok::<_, ExecutionError>(ExecutionOutput::new(json!("too late")))
        }
    });
    let (engine, _store, _clock) = engine_with_clock(registry);

    let task = engine
        .submit(SubmitRequest::new("slow", json!({})))
        .await
        .unwrap()
        .task;
    started.notified().await;
    let mut stream = engine.stream(task.id);

    engine.cancel(task.id, Some("user navigated away")).await.unwrap();
    gate.notify_one();

    let last = loop {
        let event = stream.next().await.unwrap();
        if event.is_terminal() {
            break event;
        }
    };
    match last {
        StreamEvent::Complete(snapshot) => {
            assert_eq!(snapshot.status, TaskStatus::Cancelled);
            assert_eq!(snapshot.error_message.as_deref(), Some("user navigated away"));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }

    engine.pool().wait_idle().await;
    let task = engine.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.is_none());
    assert_eq!(engine.pool_stats().results_discarded, 1);
}
