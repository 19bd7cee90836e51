//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Install the process-wide `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`). With `json = true`
/// every event is one JSON object per line, for log shippers.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = if json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
    } else {
        builder.try_init()
    };
}
