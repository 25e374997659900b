//! Logging initialisation
//!
//! Notifications are emitted as `tracing` events; this sets up the subscriber
//! that writes them out.
//!
//! - `RUST_LOG` always takes precedence
//! - otherwise `logging.filter` from the config file, if set
//! - otherwise the directive matching the configured severity
//!
//! `NO_COLOR` disables ANSI output. Every notification carries the same
//! target ([`NOTIFICATION_TARGET`](crate::severity::NOTIFICATION_TARGET)),
//! so targets are left out of the output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::severity::Severity;

/// Filter used when `RUST_LOG` is not set
pub fn log_filter(config: &LoggingConfig, threshold: Severity) -> String {
    match config.filter.as_deref() {
        Some(filter) if !filter.trim().is_empty() => filter.to_string(),
        _ => threshold.tracing_directive().to_string(),
    }
}

fn env_filter(filter: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter)
    }
}

/// Initialize human-readable logging to stderr
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging(filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter(filter))
        .try_init();
}

/// Initialize logging with JSON output
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(env_filter(filter))
        .try_init();
}

/// Initialize logging from the `[logging]` section
///
/// `json_format` without the `json-logging` feature falls back to plain text.
pub fn init_logging_from_config(config: &LoggingConfig, threshold: Severity) {
    let filter = log_filter(config, threshold);

    if config.json_format {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(&filter);
            return;
        }
    }
    init_logging(&filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_follows_severity() {
        let config = LoggingConfig::default();
        assert_eq!(log_filter(&config, Severity::Debug), "debug");
        assert_eq!(log_filter(&config, Severity::Warning), "warn");
        assert_eq!(log_filter(&config, Severity::Critical), "error");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = LoggingConfig {
            filter: Some("gpsd_tcp=trace".to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(log_filter(&config, Severity::Error), "gpsd_tcp=trace");

        let blank = LoggingConfig {
            filter: Some("  ".to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(log_filter(&blank, Severity::Notice), "info");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging("info");
        init_logging("debug");
    }
}
