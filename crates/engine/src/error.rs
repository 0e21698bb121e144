//! Store and engine error model.

use forgetask_core::DomainError;
use thiserror::Error;

/// Error returned by task store and engine operations.
///
/// `Conflict` and `NotFound` are expected under concurrency (a claim race was
/// lost, a task was cancelled or cleaned up meanwhile). Background loops log
/// them at debug level and move on; only `Storage` indicates something broken.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Caller input is malformed. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A guarded write lost: the record is no longer in the expected status,
    /// version or attempt.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl core::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for outcomes that are normal when several workers race on the
    /// same task.
    pub fn is_expected_under_concurrency(&self) -> bool {
        self.is_conflict() || self.is_not_found()
    }
}

impl From<DomainError> for TaskError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::UnknownVariant { .. } => Self::Storage(err.to_string()),
            DomainError::StaleVersion { .. } => Self::Conflict(err.to_string()),
        }
    }
}
