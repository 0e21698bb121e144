//! Durable task execution engine.
//!
//! Runs long-lived asynchronous work on behalf of a request-driven
//! application. Every submitted task eventually settles exactly once from the
//! caller's point of view, survives process crashes and is retried on
//! transient failure.
//!
//! ## Design
//!
//! - The [`store::TaskStore`] is the single source of truth; components talk to
//!   each other only through it
//! - Every status-dependent write is a guarded update (`WHERE status = ..`,
//!   `version = ..`), never read-then-write
//! - Execution is at-least-once; duplicate submissions are collapsed by
//!   idempotency key at the boundary
//!
//! ## Components
//!
//! - `TaskStore`: task records + append-only audit events (in-memory, Postgres)
//! - `IdempotencyIndex`: dedupes submissions sharing a key within a window
//! - Claim protocol: `claim`, `claim_retry`, `claim_batch` on the store
//! - `RetryPolicy`: exponential backoff with jitter, retry-vs-give-up decision
//! - `DeadLetterStore`: exhausted tasks with failure history and requeue
//! - `WorkerPool`: bounded executor that claims, runs and settles tasks
//! - `RecoveryScanner`: periodic sweep for stale and due-for-retry tasks
//! - `ProgressStreamer`: polling change detector producing client events

pub mod claim;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod idempotency;
pub mod notify;
pub mod progress;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod task;
pub mod worker_pool;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use dead_letter::{DeadLetterRecord, DeadLetterStats, DeadLetterStore, FailureEntry};
pub use engine::{SubmitRequest, Submission, TaskEngine};
pub use error::TaskError;
pub use executor::{
    ExecutionContext, ExecutionError, ExecutionErrorKind, ExecutionOutput, ExecutorRegistry,
    FnExecutor, ProgressReporter, TaskExecutor,
};
pub use hooks::TerminalHooks;
pub use notify::{
    HttpNotifier, Notifier, NoopNotifier, NotifyError, WebhookConfig, WebhookEvent, WebhookPayload,
};
pub use progress::{
    ProgressSnapshot, ProgressStreamer, StreamConfig, StreamEvent, StreamFailure, StreamHeartbeat,
};
pub use recovery::{RecoveryConfig, RecoveryHandle, RecoveryReport, RecoveryScanner};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
pub use store::{InMemoryTaskStore, PostgresTaskStore, StoreSettings, TaskStore};
pub use task::{
    CreateOutcome, FailureCategory, NewTask, Pagination, Precondition, ProgressUpdate, Task,
    TaskEvent, TaskEventType, TaskFailure, TaskFilter, TaskStatus, WorkerId,
};
pub use worker_pool::{EnqueueOutcome, PoolStats, WorkerPool, WorkerPoolConfig};

pub use forgetask_core::{DeadLetterId, EventId, ExpectedVersion, TaskId};
