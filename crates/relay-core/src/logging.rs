//! Process-wide `tracing` subscriber.
//!
//! The filter comes from `RELAY_LOG` when it holds a valid directive, then
//! from the caller's fallback, then `info`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "RELAY_LOG";

/// Installs the fmt subscriber. Returns `false` when one was already set,
/// so repeated calls from tests or embedders are harmless.
pub fn init_tracing(fallback_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(fallback_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}

fn build_filter(fallback_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(fallback_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
