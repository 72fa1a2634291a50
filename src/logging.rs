//! Log subscriber set-up.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Parses a configured level, falling back to `info` for unknown names.
pub fn parse_level(level: &str) -> (LevelFilter, bool) {
    match level.trim().to_ascii_lowercase().parse::<LevelFilter>() {
        Ok(filter) => (filter, true),
        Err(_) => (LevelFilter::INFO, false),
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` overrides `level`.
///
/// Calling it twice is harmless; the second call keeps the first
/// subscriber.
pub fn init(level: &str) {
    let (filter, valid) = parse_level(level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy();
    let installed = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(env_filter)
        .try_init()
        .is_ok();
    if installed && !valid {
        tracing::warn!(level, "invalid log level, using info");
    }
}
