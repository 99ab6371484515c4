//! Tracing subscriber setup.
//!
//! Configures structured logging with:
//! - Environment-based filter (via RUST_LOG), falling back to the given level
//! - Human-readable or JSON output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the `kiln` binary.
///
/// # Arguments
///
/// * `log_level` - Filter directive used when RUST_LOG is not set
/// * `json` - Emit one JSON object per event instead of text
///
/// # Panics
///
/// Panics if tracing has already been initialized.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    tracing::debug!(log_level, json, "Tracing initialized");
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}
