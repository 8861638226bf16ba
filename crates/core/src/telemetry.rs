//! Structured logging bootstrap shared by the hostwatch binaries.

use tracing_subscriber::EnvFilter;

use crate::error::CoreError;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `fallback_filter` is used.
pub fn init(fallback_filter: &str) -> Result<(), CoreError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| CoreError::Telemetry(e.to_string()))
}
