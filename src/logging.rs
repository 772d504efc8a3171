//! Structured logging setup: `tracing-subscriber`'s `EnvFilter` driven by
//! `RUST_LOG`, defaulting to `info` for this crate and `warn` upstream.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber. Safe to call more than once (the
/// later calls are no-ops) so both the binary and integration tests can
/// call it unconditionally.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
