//! Failure reports fed into the retry decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const HEARTBEAT_TIMEOUT_CODE: &str = "HEARTBEAT_TIMEOUT";
pub const UNKNOWN_TASK_KIND_CODE: &str = "UNKNOWN_TASK_KIND";
pub const VALIDATION_ERROR_CODE: &str = "VALIDATION_ERROR";
pub const TRANSIENT_ERROR_CODE: &str = "TRANSIENT_ERROR";
pub const PERMANENT_ERROR_CODE: &str = "PERMANENT_ERROR";
pub const EXECUTION_ERROR_CODE: &str = "EXECUTION_ERROR";
pub const CANCELLED_CODE: &str = "CANCELLED";
pub const DEAD_LETTERED_CODE: &str = "DEAD_LETTERED";

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Input rejected by the executor.
    Validation,
    /// Timeouts, rate limits, transient IO.
    Transient,
    /// Unknown kind, content rejected.
    Permanent,
    /// Unclassified error raised by the executor.
    Unknown,
    /// The worker stopped heartbeating (crashed or wedged).
    HeartbeatTimeout,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::Transient => "transient",
            FailureCategory::Permanent => "permanent",
            FailureCategory::Unknown => "unknown",
            FailureCategory::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

/// A failed attempt as reported to `TaskStore::fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    pub code: String,
    pub retryable: bool,
    pub category: FailureCategory,
}

impl TaskFailure {
    pub fn new(
        message: impl Into<String>,
        code: impl Into<String>,
        retryable: bool,
        category: FailureCategory,
    ) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            retryable,
            category,
        }
    }

    /// Synthetic failure for a RUNNING task whose worker went silent.
    ///
    /// Always retryable; the attempt budget still caps it.
    pub fn heartbeat_timeout(timeout: Duration) -> Self {
        Self::new(
            format!("heartbeat timeout: no heartbeat for {}s", timeout.as_secs()),
            HEARTBEAT_TIMEOUT_CODE,
            true,
            FailureCategory::HeartbeatTimeout,
        )
    }

    pub fn unknown_kind(kind: &str) -> Self {
        Self::new(
            format!("no executor registered for task kind '{kind}'"),
            UNKNOWN_TASK_KIND_CODE,
            false,
            FailureCategory::Permanent,
        )
    }
}
