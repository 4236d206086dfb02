//! Structured logging initialization.
//!
//! Configures the tracing subscriber. The `RUST_LOG` environment variable
//! takes precedence over the configuration file level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem. Call once, early.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_ansi(true)
                        .with_thread_names(config.thread_names),
                )
                .init();
        }
        (LogFormat::Pretty, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_ansi(true)
                        .with_thread_names(config.thread_names)
                        .without_time(),
                )
                .init();
        }
        (LogFormat::Compact, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(true)
                        .with_thread_names(config.thread_names),
                )
                .init();
        }
        (LogFormat::Compact, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(true)
                        .with_thread_names(config.thread_names)
                        .without_time(),
                )
                .init();
        }
        (LogFormat::Json, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_thread_names(config.thread_names))
                .init();
        }
        (LogFormat::Json, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_thread_names(config.thread_names)
                        .without_time(),
                )
                .init();
        }
    }
}
