//! `forgetask-core`: identifiers, errors and concurrency primitives shared by
//! the task engine crates.
//!
//! Nothing in here performs IO.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, EventId, TaskId};
pub use version::ExpectedVersion;
