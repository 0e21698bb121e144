//! Tracing and logging setup shared by forgetask binaries.

/// Initialize process-wide tracing with the default `info` filter and the
/// format selected by `FORGETASK_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], falling back to `default_directive` when `RUST_LOG` is
/// unset or malformed.
pub fn init_with_default(default_directive: &str) {
    tracing::init(default_directive, LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::LogFormat;
