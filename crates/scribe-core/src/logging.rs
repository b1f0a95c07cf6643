//! `tracing` subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with stderr output.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, records are
/// emitted as one JSON object per line. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails if a global subscriber is already installed
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.compact().try_init();
    }
}
