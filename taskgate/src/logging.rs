//! Tracing subscriber setup.
//!
//! Logs go through a non-blocking writer so a slow terminal or pipe never
//! stalls the runtime. In stdio mode stdout carries the protocol, so logs go
//! to stderr.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use taskgate_core::config::{LogFormat, LoggingConfig, TransportMode};

/// Build the filter: `RUST_LOG` wins, then the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// The returned guard must be held for the life of the process so buffered
/// lines are flushed on exit.
pub fn init(config: &LoggingConfig, mode: TransportMode) -> WorkerGuard {
    let (writer, guard) = match mode {
        TransportMode::Stdio => tracing_appender::non_blocking(std::io::stderr()),
        TransportMode::Http => tracing_appender::non_blocking(std::io::stdout()),
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter(config))
        .with_target(true);

    let result = match config.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.with_ansi(false).try_init(),
    };
    if let Err(e) = result {
        eprintln!("taskgate: logging already initialized: {e}");
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_env_filter_falls_back_to_config_level() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::remove_var("RUST_LOG") };
        let config = LoggingConfig {
            level: "warn,taskgate_core=debug".into(),
            ..LoggingConfig::default()
        };
        let filter = env_filter(&config).to_string();
        assert!(filter.contains("taskgate_core=debug"), "{filter}");
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_level_falls_back_to_info() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::remove_var("RUST_LOG") };
        let config = LoggingConfig {
            level: "taskgate=loud".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(env_filter(&config).to_string(), "info");
    }
}
