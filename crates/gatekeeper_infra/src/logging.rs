//! Logging setup. Everything goes to stderr; stdout carries decision JSON only.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter read from the environment when no explicit level is given.
pub const LOG_ENV_VAR: &str = "GATEKEEPER_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Resolve the filter: explicit level, then `GATEKEEPER_LOG`, then `warn`.
pub fn log_filter(level: Option<&str>) -> EnvFilter {
    let env = std::env::var(LOG_ENV_VAR).ok();
    resolve_filter(level, env.as_deref())
}

/// First directive string that parses wins; unparseable ones are skipped.
fn resolve_filter(level: Option<&str>, env: Option<&str>) -> EnvFilter {
    [level, env]
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(level: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(log_filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();
}
