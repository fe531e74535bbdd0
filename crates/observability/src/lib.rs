//! Process-wide tracing setup shared by the worker binary and tools.

pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};

/// Initialize tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    self::tracing::init(&LogSettings::from_env());
}
