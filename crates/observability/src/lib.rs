//! Process-wide tracing/logging setup shared by workers and tests.

/// Initialize process-wide tracing with the default configuration.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, format).
pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};
