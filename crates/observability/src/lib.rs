//! Process-wide tracing setup for outbox hosts and the reaper binary.

/// Initialize process-wide tracing with an `info` default.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with_level("info");
}

/// Initialize tracing, using `level` when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) {
    tracing::init_with_level(level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
