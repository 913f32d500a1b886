//! Logging setup for processes embedding Scatter nodes.
//!
//! Every component logs through `tracing`; this module only installs the
//! console subscriber. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

/// Install the console subscriber.
///
/// Safe to call more than once: later calls leave the first subscriber in
/// place and return `false`.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
