//! # Microbus Telemetry
//!
//! Logs, metrics and traces of a Microbus process.
//!
//! Log lines are structured `tracing` events. Metrics go through the
//! `metrics` facade into a Prometheus recorder. Spans are OpenTelemetry
//! spans whose context rides in the `traceparent` header of bus messages, so
//! a call that hops across microservices stays in one trace.
//!
//! ```rust,ignore
//! use microbus_core::Deployment;
//! use microbus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new("microbus", Deployment::Prod)
//!     .with_metrics_addr("0.0.0.0:9090");
//! let _guard = init_telemetry(config)?;
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use config::TelemetryConfig;
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, render_metrics, InFlightGuard, MetricsConfig};
pub use tracing::{force_trace, init_tracing, ForceTraceSampler, TracingConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Flushes pending spans and stops the tracer provider when dropped. Hold it
/// in `main`.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl TelemetryGuard {
    /// Wraps the provider returned by [`init_tracing`].
    #[must_use]
    pub fn new(tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>) -> Self {
        Self { tracer_provider }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            for result in provider.force_flush() {
                if let Err(e) = result {
                    eprintln!("flushing spans: {e}");
                }
            }
            if let Err(e) = provider.shutdown() {
                eprintln!("stopping tracer provider: {e}");
            }
        }
    }
}

/// Installs logging first so that failures of the other two are visible,
/// then metrics, then tracing.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryResult<TelemetryGuard> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    let tracer_provider = init_tracing(&config.tracing)?;
    Ok(TelemetryGuard::new(tracer_provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_guard_without_provider() {
        let guard = TelemetryGuard::new(None);
        drop(guard);
    }

    #[test]
    fn test_telemetry_guard_flushes_provider() {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder()
            .with_sampler(ForceTraceSampler::new(1.0))
            .build();
        let guard = TelemetryGuard::new(Some(provider));
        drop(guard);
    }
}
