//! Diagnostic logging setup.
//!
//! Initialized once at process start. Level is driven by `RUST_LOG`
//! (falling back to the `logging.level` config value, then `info`).

use tracing_subscriber::EnvFilter;

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}
