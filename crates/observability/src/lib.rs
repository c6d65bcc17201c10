//! Process-wide tracing/logging setup shared by every ledger binary.

pub mod tracing;

pub use crate::tracing::{LOG_FORMAT_ENV, LogFormat, init_with};

/// Install the global subscriber using `RUST_LOG` and the format named by
/// [`LOG_FORMAT_ENV`]. Later calls are no-ops.
pub fn init() {
    tracing::init();
}
