// Logging
//
// Tracing subscriber setup for the CLI.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber, writing to stderr so command output on
/// stdout stays machine-readable.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
