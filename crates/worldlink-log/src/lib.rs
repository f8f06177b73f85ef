//! Structured logging for the world client.
//!
//! Console output goes through `tracing-subscriber`'s fmt layer. An optional
//! JSON log file captures the same events for post-mortem analysis of
//! dropped sessions and reconnect storms. `RUST_LOG` wins over the
//! configured level.

use std::path::Path;

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use worldlink_config::Config;

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info,worldlink_net=info";

/// File name of the JSON log written under `log_dir`.
pub const LOG_FILE_NAME: &str = "worldlink.log";

/// Filter directives for `config`, falling back to [`DEFAULT_FILTER`].
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.clone()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Install the global subscriber.
///
/// * `log_dir` - directory for the JSON log file; `None` logs to the console only
/// * `config` - optional configuration providing `debug.log_level`
///
/// Fails if a global subscriber is already installed.
///
/// ```no_run
/// use worldlink_config::Config;
/// use worldlink_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), Some(&config)).unwrap();
/// ```
pub fn init_logging(log_dir: Option<&Path>, config: Option<&Config>) -> Result<(), TryInitError> {
    let directives = filter_directives(config);
    // RUST_LOG overrides the configured level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    // Console layer: human-readable format with timestamps
    let console_layer = fmt::layer()
        .with_target(true) // Show module path
        .with_thread_names(true) // Session drivers run on runtime workers
        .with_level(true)
        .with_timer(fmt::time::uptime()); // Time since client start

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    // Also log to a file for post-mortem analysis of dropped sessions
    if let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false) // No ANSI color codes in file output
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json(); // Structured JSON for machine parsing

        return subscriber.with(file_layer).try_init();
    }

    subscriber.try_init()
}

/// `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
