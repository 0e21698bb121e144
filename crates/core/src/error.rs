//! Errors raised by the pure building blocks in this crate.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures: bad input or a stale read. Nothing here is
/// retryable by waiting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A string did not parse into the named identifier type.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stored discriminator (status, event type) has no matching variant.
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// The record moved past the version the caller read.
    #[error("stale version: expected {expected}, found {actual}")]
    StaleVersion { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }
}
