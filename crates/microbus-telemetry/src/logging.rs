//! Structured logging.
//!
//! Log lines are JSON outside of `LOCAL` so they can be shipped as is, and
//! human-readable on a developer machine. Every microservice logs with the
//! field names in [`fields`].
//!
//! ```rust,ignore
//! use microbus_telemetry::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::for_deployment(Deployment::Prod))?;
//! tracing::info!(host = "hello.example", id = "a1b2c3", "Started");
//! ```

use microbus_core::Deployment;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, such as `info` or `microbus_connector=debug,info`.
    /// Empty disables logging.
    pub filter: String,

    /// JSON lines instead of pretty output.
    pub json: bool,

    /// Include the source file and line of each event.
    pub location: bool,
}

impl LogConfig {
    /// Pretty output at `debug` with source locations for `LOCAL`, JSON at
    /// `info` everywhere else.
    #[must_use]
    pub fn for_deployment(deployment: Deployment) -> Self {
        let local = deployment == Deployment::Local;
        Self {
            filter: if local { "debug" } else { "info" }.to_string(),
            json: !local,
            location: local,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_deployment(Deployment::Prod)
    }
}

/// Installs the global subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> TelemetryResult<()> {
    if config.filter.trim().is_empty() {
        return Ok(());
    }
    let filter = create_env_filter(&config.filter)?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_file(config.location)
            .with_line_number(config.location)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(config.location)
            .with_line_number(config.location)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInstalled(e.to_string()))
}

/// Parses an `EnvFilter` directive.
pub fn create_env_filter(filter: &str) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(filter).map_err(|e| TelemetryError::InvalidFilter {
        filter: filter.to_string(),
        reason: e.to_string(),
    })
}

/// Field names shared by the log lines of all microservices.
pub mod fields {
    /// Host name of the microservice.
    pub const HOST: &str = "host";
    /// Instance id of the microservice.
    pub const ID: &str = "id";
    /// Message id.
    pub const MSG_ID: &str = "msg_id";
    /// Bus subject.
    pub const SUBJECT: &str = "subject";
    /// Error description.
    pub const ERROR: &str = "error";
    /// Trace id.
    pub const TRACE_ID: &str = "trace_id";
}
