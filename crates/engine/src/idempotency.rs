//! Idempotency index: collapses submissions sharing a key within a window.
//!
//! The in-memory store keeps one of these under its state lock so lookup and
//! insert happen atomically. The PostgreSQL store enforces the same contract
//! with the `task_idempotency_keys` primary key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use forgetask_core::TaskId;

use crate::error::TaskError;
use crate::task::types::MAX_IDEMPOTENCY_KEY_LEN;

/// Reject keys that are empty or longer than the storage column.
pub fn validate_key(key: &str) -> Result<(), TaskError> {
    if key.is_empty() {
        return Err(TaskError::validation("idempotency key must not be empty"));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(TaskError::validation(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

/// Key -> task mapping with per-entry expiry.
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    entries: HashMap<String, Entry>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task currently owning `key`, if the entry has not expired.
    pub fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<TaskId> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.task_id)
    }

    /// Bind `key` to `task_id` unless a live entry exists, in which case the
    /// existing owner is returned as the error.
    pub fn reserve(
        &mut self,
        key: &str,
        task_id: TaskId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskId> {
        if let Some(existing) = self.lookup(key, now) {
            return Err(existing);
        }
        self.entries
            .insert(key.to_string(), Entry { task_id, expires_at });
        Ok(())
    }

    /// Drop the binding if it still points at `task_id`.
    pub fn release(&mut self, key: &str, task_id: TaskId) {
        if self.entries.get(key).is_some_and(|e| e.task_id == task_id) {
            self.entries.remove(key);
        }
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn live_key_returns_existing_owner() {
        let now = Utc::now();
        let mut index = IdempotencyIndex::new();
        let first = TaskId::new();
        let second = TaskId::new();

        index
            .reserve("k1", first, now + Duration::hours(24), now)
            .unwrap();
        assert_eq!(
            index.reserve("k1", second, now + Duration::hours(24), now),
            Err(first)
        );
        assert_eq!(index.lookup("k1", now), Some(first));
    }

    #[test]
    fn expired_key_can_be_rebound() {
        let now = Utc::now();
        let mut index = IdempotencyIndex::new();
        let first = TaskId::new();
        let second = TaskId::new();

        index.reserve("k1", first, now + Duration::hours(1), now).unwrap();
        let later = now + Duration::hours(2);

        assert_eq!(index.lookup("k1", later), None);
        index
            .reserve("k1", second, later + Duration::hours(1), later)
            .unwrap();
        assert_eq!(index.lookup("k1", later), Some(second));
    }

    #[test]
    fn release_only_drops_own_binding() {
        let now = Utc::now();
        let mut index = IdempotencyIndex::new();
        let owner = TaskId::new();

        index.reserve("k", owner, now + Duration::hours(1), now).unwrap();
        index.release("k", TaskId::new());
        assert_eq!(index.len(), 1);

        index.release("k", owner);
        assert!(index.is_empty());
    }

    #[test]
    fn purge_drops_expired_entries() {
        let now = Utc::now();
        let mut index = IdempotencyIndex::new();
        index.reserve("a", TaskId::new(), now + Duration::minutes(1), now).unwrap();
        index.reserve("b", TaskId::new(), now + Duration::hours(1), now).unwrap();

        assert_eq!(index.purge_expired(now + Duration::minutes(5)), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("order-42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(256)).is_err());
    }
}
