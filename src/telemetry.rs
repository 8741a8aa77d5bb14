//! Logging initialisation
//!
//! Builds a `tracing-subscriber` registry with an `EnvFilter` and a single
//! fmt layer. `RUST_LOG` wins over the configured level so a single run can
//! be turned up without editing the config file.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogFormat;

/// Errors that can occur during logging initialisation
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured level is not a valid filter directive
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter {
        /// Directive that failed to parse
        filter: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialisation
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level or filter directive (e.g. `info`, `scale_agent=debug`)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Build the filter, preferring `RUST_LOG` when set
pub fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = format!("{},hyper=warn,reqwest=warn,tungstenite=warn", level);
    EnvFilter::try_new(&directive).map_err(|e| TelemetryError::InvalidFilter {
        filter: level.to_string(),
        message: e.to_string(),
    })
}

/// Install the global subscriber
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(&config.level)?;

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
