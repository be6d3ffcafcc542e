//! Log sink initialization.
//!
//! Thin wrappers over `tracing-subscriber` matching the `loglevel`
//! option. Initialization is tolerant: a second call is a no-op, and an
//! unparsable filter falls back to `warn`.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Initialize a stderr subscriber with the given filter directive.
pub fn init(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .try_init();
}

/// Initialize a subscriber appending to a log file.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened.
pub fn init_with_file(level: &str, path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let _ = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false),
        )
        .try_init();
    Ok(())
}
