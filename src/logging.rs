//! Tracing subscriber setup for the command-line player.
//!
//! Library code only emits events; installing a subscriber is up to the binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "r_chime=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable output on stderr.
    Pretty,
    /// One JSON object per event on stderr.
    Json,
    /// No subscriber at all.
    Silent,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init_logging(format: LogFormat) -> Result<(), LoggingError> {
    match format {
        LogFormat::Silent => Ok(()),
        LogFormat::Pretty => Registry::default()
            .with(env_filter())
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LogFormat::Json => Registry::default()
            .with(env_filter())
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            )
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
    }
}
