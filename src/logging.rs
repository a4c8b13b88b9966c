//! Tracing setup.
//!
//! Structured, async-aware logging via `tracing` + `tracing-subscriber`.
//! The configured level acts as the default filter; `RUST_LOG` overrides it.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber. Safe to call once per process; a second
/// call (e.g. from tests) is a no-op.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
