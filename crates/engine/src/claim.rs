//! Claim helpers for background loops.
//!
//! A lost claim race (`Conflict`) or a vanished task (`NotFound`) is the
//! normal outcome when several workers compete; these helpers turn both into
//! `Ok(None)` with a debug log so callers can log-and-skip.

use tracing::debug;

use forgetask_core::TaskId;

use crate::error::TaskError;
use crate::store::TaskStore;
use crate::task::{Task, WorkerId};

/// Claim a PENDING task, or `None` if someone else got there first.
pub async fn try_claim(
    store: &dyn TaskStore,
    id: TaskId,
    worker: &WorkerId,
) -> Result<Option<Task>, TaskError> {
    swallow_expected(id, "claim", store.claim(id, worker).await)
}

/// Claim a RETRYING task whose retry time has passed.
pub async fn try_claim_retry(
    store: &dyn TaskStore,
    id: TaskId,
    worker: &WorkerId,
) -> Result<Option<Task>, TaskError> {
    swallow_expected(id, "claim_retry", store.claim_retry(id, worker).await)
}

pub(crate) fn swallow_expected<T>(
    id: TaskId,
    operation: &str,
    result: Result<T, TaskError>,
) -> Result<Option<T>, TaskError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_expected_under_concurrency() => {
            debug!(task_id = %id, operation, error = %e, "skipped: task handled elsewhere");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
