//! Telemetry initialization for structured logging
//!
//! Sets up the global `tracing` subscriber with an `EnvFilter` and either a
//! JSON formatter (for log shippers) or the human-readable one (for local
//! runs). Metrics use the global OpenTelemetry meter provider; whoever embeds
//! the controller installs an exporter, otherwise instruments are no-ops.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,cce_controller=debug";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Filter directive; `None` reads `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
    pub filter: Option<String>,

    /// Line format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cce-controller".to_string(),
            filter: None,
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.filter {
            Some(directive) => {
                EnvFilter::try_new(directive).map_err(|e| TelemetryError::Filter(e.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use cce_controller::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::default())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    let json_layer = (config.format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let pretty_layer = (config.format == LogFormat::Pretty)
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
