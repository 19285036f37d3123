//! Tracing and logging setup shared by saga hosts and tests.

/// Initialize process-wide tracing, format chosen by `SAGAFLOW_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat};
