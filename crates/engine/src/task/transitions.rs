//! Pure state transitions.
//!
//! Each method validates the current status, mutates the task in place, bumps
//! the version and returns the audit event to append. Stores run these inside
//! their atomic write so the status check and the update cannot be split.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};

use forgetask_core::{EventId, TaskId};

use super::failure::{CANCELLED_CODE, DEAD_LETTERED_CODE, TaskFailure};
use super::types::{ProgressUpdate, Task, TaskEvent, TaskEventType, TaskStatus, WorkerId};
use crate::clock::chrono_duration;
use crate::error::TaskError;
use crate::retry::RetryDecision;

/// Audit event draft produced by a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event_type: TaskEventType,
    pub previous_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub data: JsonValue,
}

impl Transition {
    pub fn created(task: &Task) -> Self {
        Self {
            event_type: TaskEventType::Created,
            previous_status: None,
            new_status: task.status,
            data: json!({
                "kind": task.kind,
                "priority": task.priority,
                "max_attempts": task.max_attempts,
            }),
        }
    }

    /// Claim event; `task` is the post-claim state.
    pub fn claimed(from: TaskStatus, task: &Task) -> Self {
        Self {
            event_type: TaskEventType::Claimed,
            previous_status: Some(from),
            new_status: task.status,
            data: json!({
                "worker_id": task.worker_id,
                "attempt": task.attempt_count,
            }),
        }
    }

    pub fn into_event(self, task_id: TaskId, now: DateTime<Utc>) -> TaskEvent {
        TaskEvent {
            id: EventId::new(),
            task_id,
            event_type: self.event_type,
            previous_status: self.previous_status,
            new_status: self.new_status,
            event_data: self.data,
            created_at: now,
        }
    }
}

impl Task {
    pub(crate) fn require_status(&self, allowed: &[TaskStatus], op: &str) -> Result<(), TaskError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TaskError::conflict(format!(
                "cannot {op} task {} in status {}",
                self.id, self.status
            )))
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    fn transition(
        &self,
        event_type: TaskEventType,
        previous: TaskStatus,
        data: JsonValue,
    ) -> Transition {
        Transition {
            event_type,
            previous_status: Some(previous),
            new_status: self.status,
            data,
        }
    }

    /// PENDING -> RUNNING (or RETRYING -> RUNNING once due).
    pub fn claim(
        &mut self,
        from: TaskStatus,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        if !matches!(from, TaskStatus::Pending | TaskStatus::Retrying) {
            return Err(TaskError::validation(format!(
                "tasks can only be claimed from pending or retrying, not {from}"
            )));
        }
        self.require_status(&[from], "claim")?;
        if from == TaskStatus::Retrying && !self.is_due_for_retry(now) {
            return Err(TaskError::conflict(format!(
                "task {} is not due for retry yet",
                self.id
            )));
        }
        if self.attempt_count >= self.max_attempts {
            return Err(TaskError::conflict(format!(
                "task {} has exhausted its {} attempts",
                self.id, self.max_attempts
            )));
        }

        self.status = TaskStatus::Running;
        self.attempt_count += 1;
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
        self.worker_id = Some(worker.to_string());
        self.next_retry_at = None;
        self.progress_percent = 0;
        self.progress_message = None;
        self.current_step = None;
        self.current_step_num = None;
        self.touch(now);

        Ok(Transition::claimed(from, self))
    }

    /// Merge a progress report. Percent is clamped and never decreases.
    pub fn apply_progress(
        &mut self,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.require_status(&[TaskStatus::Running], "update progress of")?;

        if let Some(percent) = update.percent {
            let clamped = percent.clamp(0, 100) as u8;
            self.progress_percent = self.progress_percent.max(clamped);
        }
        if let Some(message) = &update.message {
            self.progress_message = Some(message.clone());
        }
        if let Some(step) = &update.step {
            self.current_step = Some(step.clone());
        }
        if let Some(total) = update.total_steps {
            self.total_steps = Some(total);
        }
        if let Some(num) = update.step_num {
            self.current_step_num = Some(num);
        }
        self.last_heartbeat_at = Some(now);
        self.touch(now);
        Ok(())
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.require_status(&[TaskStatus::Running], "heartbeat")?;
        self.last_heartbeat_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(
        &mut self,
        result: JsonValue,
        usage_metrics: Option<JsonValue>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        self.require_status(&[TaskStatus::Running], "complete")?;

        self.status = TaskStatus::Completed;
        self.progress_percent = 100;
        self.result = Some(result);
        self.usage_metrics = usage_metrics;
        self.error_message = None;
        self.error_code = None;
        self.worker_id = None;
        self.completed_at = Some(now);
        self.expires_at = Some(now + chrono_duration(retention));
        self.touch(now);

        let data = json!({ "attempt": self.attempt_count });
        Ok(self.transition(TaskEventType::Completed, TaskStatus::Running, data))
    }

    /// RUNNING -> RETRYING or FAILED, as decided by the retry policy.
    pub fn fail(
        &mut self,
        failure: &TaskFailure,
        decision: &RetryDecision,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        self.require_status(&[TaskStatus::Running], "fail")?;

        self.last_error = Some(failure.message.clone());
        self.is_retryable = failure.retryable;
        self.worker_id = None;

        let (event_type, data) = match decision {
            RetryDecision::Retry {
                delay,
                next_retry_at,
            } => {
                self.status = TaskStatus::Retrying;
                self.next_retry_at = Some(*next_retry_at);
                (
                    TaskEventType::RetryScheduled,
                    json!({
                        "error": failure.message,
                        "code": failure.code,
                        "category": failure.category,
                        "attempt": self.attempt_count,
                        "delay_ms": delay.as_millis() as u64,
                        "next_retry_at": next_retry_at,
                    }),
                )
            }
            RetryDecision::GiveUp(reason) => {
                self.status = TaskStatus::Failed;
                self.next_retry_at = None;
                self.error_message = Some(failure.message.clone());
                self.error_code = Some(failure.code.clone());
                self.completed_at = Some(now);
                self.expires_at = Some(now + chrono_duration(retention));
                (
                    TaskEventType::Failed,
                    json!({
                        "error": failure.message,
                        "code": failure.code,
                        "category": failure.category,
                        "attempt": self.attempt_count,
                        "reason": reason.as_str(),
                        "final": true,
                    }),
                )
            }
        };
        self.touch(now);

        Ok(self.transition(event_type, TaskStatus::Running, data))
    }

    /// PENDING | RUNNING | RETRYING -> CANCELLED.
    pub fn cancel(
        &mut self,
        reason: Option<&str>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        if !self.status.is_cancellable() {
            return Err(TaskError::conflict(format!(
                "cannot cancel task {} in status {}",
                self.id, self.status
            )));
        }
        let previous = self.status;
        let reason = reason.unwrap_or("cancelled").to_string();

        self.status = TaskStatus::Cancelled;
        self.error_message = Some(reason.clone());
        self.error_code = Some(CANCELLED_CODE.to_string());
        self.result = None;
        self.worker_id = None;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.expires_at = Some(now + chrono_duration(retention));
        self.touch(now);

        Ok(self.transition(TaskEventType::Cancelled, previous, json!({ "reason": reason })))
    }

    /// RETRYING (due) -> PENDING.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<Transition, TaskError> {
        self.require_status(&[TaskStatus::Retrying], "requeue")?;
        if !self.is_due_for_retry(now) {
            return Err(TaskError::conflict(format!(
                "task {} is not due for retry yet",
                self.id
            )));
        }

        let scheduled_for = self.next_retry_at;
        self.status = TaskStatus::Pending;
        self.next_retry_at = None;
        self.touch(now);

        let data = json!({ "attempt": self.attempt_count, "scheduled_for": scheduled_for });
        Ok(self.transition(TaskEventType::Requeued, TaskStatus::Retrying, data))
    }

    /// Park the task in the dead-letter queue. Non-terminal tasks are forced
    /// to FAILED so nothing can claim them again.
    pub fn mark_dead_lettered(
        &mut self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        self.require_status(
            &[TaskStatus::Failed, TaskStatus::Retrying, TaskStatus::Pending],
            "dead-letter",
        )?;
        if self.dead_lettered_at.is_some() {
            return Err(TaskError::conflict(format!(
                "task {} is already dead-lettered",
                self.id
            )));
        }

        let previous = self.status;
        if previous != TaskStatus::Failed {
            self.status = TaskStatus::Failed;
            self.next_retry_at = None;
            self.error_message = Some(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "moved to dead letter queue".to_string()),
            );
            self.error_code = Some(DEAD_LETTERED_CODE.to_string());
            self.completed_at = Some(now);
            self.expires_at = Some(now + chrono_duration(retention));
        }
        self.dead_lettered_at = Some(now);
        self.touch(now);

        let data = json!({ "attempt": self.attempt_count });
        Ok(self.transition(TaskEventType::DeadLettered, previous, data))
    }

    /// Stamp the webhook delivery; only the first caller wins.
    pub fn mark_notified(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.require_status(&[TaskStatus::Completed, TaskStatus::Failed], "notify")?;
        if self.webhook_url.is_none() {
            return Err(TaskError::validation(format!(
                "task {} has no webhook url",
                self.id
            )));
        }
        if self.notification_sent_at.is_some() {
            return Err(TaskError::conflict(format!(
                "task {} was already notified",
                self.id
            )));
        }
        self.notification_sent_at = Some(now);
        self.touch(now);
        Ok(())
    }
}
