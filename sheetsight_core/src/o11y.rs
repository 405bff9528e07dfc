//! Process-wide tracing initialisation.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Honours `RUST_LOG`; defaults to `info`.
///
/// Safe to call more than once (subsequent calls are no-ops), which keeps
/// test binaries that initialise logging per-test from panicking.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
