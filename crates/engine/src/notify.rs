//! Outbound webhook notifications for terminal tasks.
//!
//! Delivery is best-effort: one POST with a timeout, failures logged by the
//! caller. The store's `mark_notified` guard decides which process sends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use forgetask_core::TaskId;

use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("webhook client error: {0}")]
    Client(String),

    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook endpoint returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookConfig {
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    TaskCompleted,
    TaskFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookFailure {
    pub message: String,
    pub code: Option<String>,
}

/// Body POSTed to a task's `webhook_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub task_id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WebhookFailure>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookPayload {
    /// `None` unless the task is COMPLETED or FAILED.
    pub fn for_task(task: &Task) -> Option<Self> {
        let event = match task.status {
            TaskStatus::Completed => WebhookEvent::TaskCompleted,
            TaskStatus::Failed => WebhookEvent::TaskFailed,
            _ => return None,
        };
        let error = task.error_message.as_ref().map(|message| WebhookFailure {
            message: message.clone(),
            code: task.error_code.clone(),
        });

        Some(Self {
            event,
            task_id: task.id,
            kind: task.kind.clone(),
            status: task.status,
            result: task.result.clone(),
            error,
            completed_at: task.completed_at,
        })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    async fn notify(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError>;
}

/// `reqwest`-backed notifier.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("forgetask/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _url: &str, _payload: &WebhookPayload) -> Result<(), NotifyError> {
        Ok(())
    }
}
