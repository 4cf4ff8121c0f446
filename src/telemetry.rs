//! Tracing setup for binaries and demos.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the application's job. This is a convenience for the common case.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"llm_profile_engine=info"`).
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        init_tracing("warn");
        assert!(!init_tracing("debug"));
    }
}
