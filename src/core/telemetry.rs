//! Logging bootstrap for binaries and tests embedding the scheduler

use tracing_subscriber::EnvFilter;

/// Error returned when a global subscriber is already installed
pub type TelemetryError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install a compact fmt subscriber, failing if one is already set.
///
/// `RUST_LOG` wins over `default_directive` when set.
pub fn try_init_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init()
}

/// Like [`try_init_tracing`], but later calls are silently ignored.
pub fn init_tracing(default_directive: &str) {
    let _ = try_init_tracing(default_directive);
}
