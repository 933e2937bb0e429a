//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the level passed
//! in. Thread names are included because reactors and negotiators are named
//! threads.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
