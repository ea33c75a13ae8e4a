//! Process-wide log output.
//!
//! The sub-crates write through the `log` facade; `init_logging` installs a
//! `tracing` subscriber that also picks those records up. Build with the
//! `logs-json` feature for one JSON object per line.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. `filter` falls back to `RUST_LOG`, then
/// to `info`. Returns `false` if a subscriber was already installed.
pub fn init_logging(filter: Option<&str>) -> bool {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    #[cfg(feature = "logs-json")]
    let result = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    #[cfg(not(feature = "logs-json"))]
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    result.is_ok()
}
