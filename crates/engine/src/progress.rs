//! Polling progress stream for a single task.
//!
//! Read-only: the streamer never claims or writes. It emits `progress` when
//! a consumer-visible field (status, percentage, message, step) moved since
//! the last emission,
//! `heartbeat` when nothing changed for a while, `complete` once the task is
//! terminal and `error` when the task vanishes or the stream outlives its
//! maximum duration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use forgetask_core::TaskId;

use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

pub const STREAM_TIMEOUT_CODE: &str = "STREAM_TIMEOUT";
pub const TASK_NOT_FOUND_CODE: &str = "NOT_FOUND";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    /// Quiet period after which a heartbeat event is sent.
    pub heartbeat_interval: Duration,
    pub max_duration: Duration,
    /// Events buffered ahead of a slow consumer.
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            max_duration: Duration::from_secs(30 * 60),
            buffer: 16,
        }
    }
}

/// Point-in-time view of a task as seen by stream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub version: u64,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for ProgressSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            version: task.version,
            progress_percent: task.progress_percent,
            progress_message: task.progress_message.clone(),
            current_step: task.current_step.clone(),
            current_step_num: task.current_step_num,
            total_steps: task.total_steps,
            attempt_count: task.attempt_count,
            result: task.result.clone(),
            error_message: task.error_message.clone(),
            error_code: task.error_code.clone(),
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeartbeat {
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub task_id: TaskId,
    pub code: String,
    pub message: String,
}

/// One line of the stream: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress(ProgressSnapshot),
    Heartbeat(StreamHeartbeat),
    Complete(ProgressSnapshot),
    Error(StreamFailure),
}

impl StreamEvent {
    /// `complete` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    /// Newline-delimited JSON encoding.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// The parts of a task a stream consumer renders. Heartbeats bump
/// `version` without touching any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VisibleState {
    status: TaskStatus,
    attempt_count: u32,
    progress_percent: u8,
    progress_message: Option<String>,
    current_step: Option<String>,
    current_step_num: Option<u32>,
    total_steps: Option<u32>,
}

impl From<&Task> for VisibleState {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            attempt_count: task.attempt_count,
            progress_percent: task.progress_percent,
            progress_message: task.progress_message.clone(),
            current_step: task.current_step.clone(),
            current_step_num: task.current_step_num,
            total_steps: task.total_steps,
        }
    }
}

#[derive(Debug, Default)]
struct ChangeDetector {
    last: Option<VisibleState>,
}

impl ChangeDetector {
    fn observe(&mut self, task: &Task) -> bool {
        let current = VisibleState::from(task);
        if self.last.as_ref() == Some(&current) {
            return false;
        }
        self.last = Some(current);
        true
    }
}

#[derive(Clone)]
pub struct ProgressStreamer {
    store: Arc<dyn TaskStore>,
    config: StreamConfig,
}

impl std::fmt::Debug for ProgressStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStreamer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProgressStreamer {
    pub fn new(store: Arc<dyn TaskStore>, config: StreamConfig) -> Self {
        Self { store, config }
    }

    /// Start polling `task_id`. The polling task stops when a terminal event
    /// is sent or the returned stream is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self, task_id: TaskId) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let store = self.store.clone();
        let config = self.config;
        tokio::spawn(async move {
            poll_task(store, config, task_id, tx).await;
        });
        ReceiverStream::new(rx)
    }
}

async fn poll_task(
    store: Arc<dyn TaskStore>,
    config: StreamConfig,
    task_id: TaskId,
    tx: mpsc::Sender<StreamEvent>,
) {
    let started = Instant::now();
    let mut last_emit = Instant::now();
    let mut detector = ChangeDetector::default();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let event = if started.elapsed() >= config.max_duration {
            StreamEvent::Error(StreamFailure {
                task_id,
                code: STREAM_TIMEOUT_CODE.to_string(),
                message: format!(
                    "stream exceeded maximum duration of {}s",
                    config.max_duration.as_secs()
                ),
            })
        } else {
            match store.get(task_id).await {
                Ok(Some(task)) if task.status.is_terminal() => {
                    StreamEvent::Complete(ProgressSnapshot::from(&task))
                }
                Ok(Some(task)) => {
                    if detector.observe(&task) {
                        StreamEvent::Progress(ProgressSnapshot::from(&task))
                    } else if last_emit.elapsed() >= config.heartbeat_interval {
                        StreamEvent::Heartbeat(StreamHeartbeat {
                            task_id,
                            at: store.now(),
                        })
                    } else {
                        continue;
                    }
                }
                Ok(None) => StreamEvent::Error(StreamFailure {
                    task_id,
                    code: TASK_NOT_FOUND_CODE.to_string(),
                    message: format!("task not found: {task_id}"),
                }),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "progress poll failed");
                    continue;
                }
            }
        };

        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            debug!(task_id = %task_id, "progress stream consumer went away");
            return;
        }
        last_emit = Instant::now();
        if terminal {
            return;
        }
    }
}
