//! Structured logging configuration.
//!
//! Initializes the global tracing subscriber from the configured
//! verbosity, with `RUST_LOG` taking precedence when set so operators can
//! raise the level of a single module without touching the config file.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once; later
/// calls are ignored (useful under test harnesses).
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
