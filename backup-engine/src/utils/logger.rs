//! Logging setup using tracing.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. A `RUST_LOG` value takes precedence
/// over the level passed in from the command line.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
