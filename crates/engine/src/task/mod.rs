//! Task data model and state machine.
//!
//! ```text
//!            claim                complete
//! PENDING ──────────► RUNNING ─────────────► COMPLETED
//!    ▲                 │   │
//!    │ requeue   fail  │   │ fail (exhausted / not retryable)
//!    │ (due)   (retry) ▼   └───────────────► FAILED
//! RETRYING ◄───────────┘
//!
//! PENDING | RUNNING | RETRYING ── cancel ──► CANCELLED
//! ```
//!
//! The transitions are pure functions on [`Task`]; stores apply them and
//! persist the result with a guarded write.

pub mod failure;
pub mod transitions;
pub mod types;

pub use failure::{FailureCategory, TaskFailure};
pub use transitions::Transition;
pub use types::{
    CreateOutcome, NewTask, Pagination, Precondition, ProgressUpdate, Task, TaskEvent,
    TaskEventType, TaskFilter, TaskStatus, WorkerId,
};
