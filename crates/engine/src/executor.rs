//! Execution contract and executor registry.
//!
//! The engine never interprets `input_params` or results; it resolves an
//! executor by task kind, hands it an [`ExecutionContext`] and maps the
//! returned [`ExecutionError`] onto a retry decision.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use forgetask_core::TaskId;

use crate::error::TaskError;
use crate::store::TaskStore;
use crate::task::failure::{
    EXECUTION_ERROR_CODE, PERMANENT_ERROR_CODE, TRANSIENT_ERROR_CODE, VALIDATION_ERROR_CODE,
};
use crate::task::{FailureCategory, Precondition, ProgressUpdate, TaskFailure, TaskStatus};

/// Classification of an executor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Input rejected. Never retried.
    Validation,
    /// Timeouts, rate limits, transient IO. Retried.
    Transient,
    /// Content rejected or otherwise hopeless. Never retried.
    Permanent,
    /// Unclassified. Retried, capped by `max_attempts`.
    Unknown,
}

impl ExecutionErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Unknown)
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Validation => FailureCategory::Validation,
            Self::Transient => FailureCategory::Transient,
            Self::Permanent => FailureCategory::Permanent,
            Self::Unknown => FailureCategory::Unknown,
        }
    }

    fn default_code(&self) -> &'static str {
        match self {
            Self::Validation => VALIDATION_ERROR_CODE,
            Self::Transient => TRANSIENT_ERROR_CODE,
            Self::Permanent => PERMANENT_ERROR_CODE,
            Self::Unknown => EXECUTION_ERROR_CODE,
        }
    }
}

/// Categorized failure raised by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    /// Overrides the kind's default error code.
    pub code: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Permanent, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Unknown, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.default_code())
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::unknown(format!("{err:#}"))
    }
}

impl From<&ExecutionError> for TaskFailure {
    fn from(err: &ExecutionError) -> Self {
        TaskFailure::new(
            err.message.clone(),
            err.code(),
            err.is_retryable(),
            err.kind.category(),
        )
    }
}

/// Successful execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub result: JsonValue,
    pub usage: Option<JsonValue>,
}

impl ExecutionOutput {
    pub fn new(result: JsonValue) -> Self {
        Self {
            result,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: JsonValue) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Progress callback bound to one claimed attempt.
///
/// Writes are guarded by the attempt number, so a reporter held by a worker
/// whose task was cancelled or recovered elsewhere gets `Conflict`.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    attempt: u32,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn TaskStore>, task_id: TaskId, attempt: u32) -> Self {
        Self {
            store,
            task_id,
            attempt,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn report(&self, update: ProgressUpdate) -> Result<(), TaskError> {
        self.store
            .update_progress(self.task_id, &update, Precondition::attempt(self.attempt))
            .await
            .map(|_| ())
    }

    pub async fn percent(&self, percent: i32) -> Result<(), TaskError> {
        self.report(ProgressUpdate::percent(percent)).await
    }

    /// True once this attempt no longer owns the task (cancelled, recovered,
    /// cleaned up). Executors should poll this between steps and stop early.
    pub async fn is_cancelled(&self) -> bool {
        match self.store.get(self.task_id).await {
            Ok(Some(task)) => {
                task.status != TaskStatus::Running || task.attempt_count != self.attempt
            }
            Ok(None) => true,
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "cancellation check failed");
                false
            }
        }
    }
}

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub kind: String,
    pub input: JsonValue,
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: ProgressReporter,
}

/// External execution contract for one or more task kinds.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError>;
}

/// Adapter turning an async closure into a [`TaskExecutor`].
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError> {
        (self.0)(ctx).await
    }
}

/// Executors keyed by kind pattern.
///
/// Resolution: exact kind, then the longest matching `prefix.*`, then `*`.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.executors.keys().collect();
        patterns.sort();
        f.debug_struct("ExecutorRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        executor: impl TaskExecutor + 'static,
    ) -> &mut Self {
        self.executors.insert(pattern.into(), Arc::new(executor));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'static,
    {
        self.register(pattern, FnExecutor(f))
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn TaskExecutor>> {
        if let Some(executor) = self.executors.get(kind) {
            return Some(executor.clone());
        }

        // Category match: "ai.*" matches "ai.summarize" and "ai.chat.reply".
        let category = self
            .executors
            .iter()
            .filter_map(|(pattern, executor)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), executor))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, executor)| executor.clone());
        if category.is_some() {
            return category;
        }

        self.executors.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use crate::task::{NewTask, WorkerId};
    use serde_json::json;

    fn labelled(label: &'static str) -> impl TaskExecutor + 'static {
        FnExecutor(move |_ctx: ExecutionContext| async move {
            Ok::<_, ExecutionError>(ExecutionOutput::new(json!(label)))
        })
    }

    async fn run(registry: &ExecutorRegistry, kind: &str) -> Option<JsonValue> {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let executor = registry.resolve(kind)?;
        let ctx = ExecutionContext {
            task_id: TaskId::new(),
            kind: kind.to_string(),
            input: json!({}),
            attempt: 1,
            max_attempts: 3,
            progress: ProgressReporter::new(store, TaskId::new(), 1),
        };
        executor.execute(ctx).await.ok().map(|out| out.result)
    }

    #[tokio::test]
    async fn exact_match_wins() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register("report.generate", labelled("exact"))
            .register("report.*", labelled("category"))
            .register("*", labelled("wildcard"));

        assert_eq!(run(&registry, "report.generate").await, Some(json!("exact")));
    }

    #[tokio::test]
    async fn category_handler() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register("ai.*", labelled("ai"))
            .register("ai.chat.*", labelled("chat"));

        assert_eq!(run(&registry, "ai.summarize").await, Some(json!("ai")));
        assert_eq!(run(&registry, "ai.chat.reply").await, Some(json!("chat")));
        assert_eq!(run(&registry, "aide.summarize").await, None);
    }

    #[tokio::test]
    async fn wildcard_handler() {
        let mut registry = ExecutorRegistry::new();
        registry.register("*", labelled("wildcard"));

        assert_eq!(run(&registry, "anything").await, Some(json!("wildcard")));
    }

    #[test]
    fn unknown_kind_has_no_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register("report.generate", labelled("exact"));

        assert!(registry.resolve("report.render").is_none());
    }

    #[test]
    fn error_kinds_map_to_retryability() {
        let cases = [
            (ExecutionError::validation("bad input"), false, VALIDATION_ERROR_CODE),
            (ExecutionError::transient("rate limited"), true, TRANSIENT_ERROR_CODE),
            (ExecutionError::permanent("rejected"), false, PERMANENT_ERROR_CODE),
            (ExecutionError::unknown("???"), true, EXECUTION_ERROR_CODE),
        ];
        for (err, retryable, code) in cases {
            let failure = TaskFailure::from(&err);
            assert_eq!(failure.retryable, retryable, "{err:?}");
            assert_eq!(failure.code, code);
        }

        let custom = ExecutionError::transient("slow").with_code("UPSTREAM_429");
        assert_eq!(TaskFailure::from(&custom).code, "UPSTREAM_429");
    }

    #[test]
    fn anyhow_errors_default_to_retryable() {
        let err: ExecutionError = anyhow::anyhow!("socket closed").into();
        assert_eq!(err.kind, ExecutionErrorKind::Unknown);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn reporter_loses_ownership_after_cancel() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.create(NewTask::new("k", json!({}))).await.unwrap().task;
        let claimed = store.claim(task.id, &WorkerId::new("w")).await.unwrap();
        let reporter = ProgressReporter::new(store.clone(), task.id, claimed.attempt_count);

        reporter.percent(30).await.unwrap();
        assert!(!reporter.is_cancelled().await);

        store
            .cancel(task.id, Some("stop"), Precondition::none())
            .await
            .unwrap();
        assert!(reporter.is_cancelled().await);
        assert!(reporter.percent(60).await.unwrap_err().is_conflict());
    }
}
