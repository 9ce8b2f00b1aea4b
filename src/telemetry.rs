//! Tracing subscriber set-up for the CLI.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "MEDIARELAY_LOG";

/// Builds the filter: `MEDIARELAY_LOG` when set, otherwise `info` when
/// `verbose` and `warn` when not.
#[must_use]
pub fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "info" } else { "warn" };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Installs a stderr `fmt` subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}
