//! Prometheus metrics for Microbus.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `microbus_server_request_duration_seconds` | Histogram | `host`, `port`, `method`, `path`, `status` |
//! | `microbus_server_requests_total` | Counter | `host`, `port`, `method`, `path`, `status` |
//! | `microbus_client_request_duration_seconds` | Histogram | `host`, `port`, `method`, `status` |
//! | `microbus_client_timeouts_total` | Counter | `host`, `port`, `method` |
//! | `microbus_ingress_response_duration_seconds` | Histogram | `host`, `port`, `method`, `status` |
//! | `microbus_ingress_response_size_bytes` | Histogram | `host`, `port`, `method`, `status` |
//! | `microbus_ingress_request_memory_bytes` | Gauge | - |
//! | `microbus_in_flight_requests` | Gauge | - |
//!
//! Recording functions are safe to call before [`init_metrics`]; the
//! `metrics` facade discards values until a recorder is installed.
//!
//! # Example
//!
//! ```rust,ignore
//! use microbus_telemetry::metrics::record_server_request;
//!
//! record_server_request("hello.example", 443, "GET", "/echo", 200, Duration::from_millis(4));
//! ```

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Label,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::TelemetryError;
use crate::TelemetryResult;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address of a scrape listener (e.g. `0.0.0.0:9090`). `None` installs
    /// the recorder without a listener; use [`render_metrics`] to read it.
    pub addr: Option<String>,

    /// Histogram buckets, in seconds, for durations.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: None,
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0,
            ],
        }
    }
}

/// Installs the Prometheus recorder.
///
/// Installing twice is an error reported by the exporter.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets(&config.duration_buckets)
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;

    let handle = match &config.addr {
        None => builder
            .install_recorder()
            .map_err(|e| TelemetryError::Recorder(e.to_string()))?,
        Some(addr) => {
            let addr: SocketAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
                TelemetryError::InvalidMetricsAddr {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }
            })?;
            // The listener is served on the current runtime
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
            let _entered = runtime.enter();
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
            runtime.spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Metrics listener stopped");
                }
            });
            handle
        }
    };
    let _ = METRICS_HANDLE.set(handle);

    register_metric_descriptions();
    Ok(())
}

/// Renders metrics in Prometheus text format, or `None` before
/// [`init_metrics`].
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_histogram!(
        "microbus_server_request_duration_seconds",
        "Time spent handling incoming requests"
    );
    describe_counter!(
        "microbus_server_requests_total",
        "Incoming requests handled"
    );
    describe_histogram!(
        "microbus_client_request_duration_seconds",
        "Time spent on outgoing requests"
    );
    describe_counter!(
        "microbus_client_timeouts_total",
        "Outgoing requests that timed out"
    );
    describe_histogram!(
        "microbus_ingress_response_duration_seconds",
        "Time spent by the ingress proxying external requests"
    );
    describe_histogram!(
        "microbus_ingress_response_size_bytes",
        "Size of responses returned by the ingress"
    );
    describe_gauge!(
        "microbus_ingress_request_memory_bytes",
        "Memory held by request bodies in the ingress"
    );
    describe_gauge!(
        "microbus_in_flight_requests",
        "Incoming requests being processed"
    );
}

/// Records an incoming request handled by a subscription.
pub fn record_server_request(
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    status: u16,
    duration: Duration,
) {
    let labels = vec![
        Label::new("host", host.to_string()),
        Label::new("port", port.to_string()),
        Label::new("method", method.to_string()),
        Label::new("path", path.to_string()),
        Label::new("status", status.to_string()),
    ];
    histogram!("microbus_server_request_duration_seconds", labels.clone())
        .record(duration.as_secs_f64());
    counter!("microbus_server_requests_total", labels).increment(1);
}

/// Records a completed outgoing request.
pub fn record_client_request(host: &str, port: u16, method: &str, status: u16, duration: Duration) {
    histogram!(
        "microbus_client_request_duration_seconds",
        "host" => host.to_string(),
        "port" => port.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records an outgoing request that timed out.
pub fn record_client_timeout(host: &str, port: u16, method: &str) {
    counter!(
        "microbus_client_timeouts_total",
        "host" => host.to_string(),
        "port" => port.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

/// Records a response returned by the ingress.
pub fn record_ingress_response(
    host: &str,
    port: u16,
    method: &str,
    status: u16,
    duration: Duration,
    size_bytes: usize,
) {
    let labels = vec![
        Label::new("host", host.to_string()),
        Label::new("port", port.to_string()),
        Label::new("method", method.to_string()),
        Label::new("status", status.to_string()),
    ];
    histogram!("microbus_ingress_response_duration_seconds", labels.clone())
        .record(duration.as_secs_f64());
    histogram!("microbus_ingress_response_size_bytes", labels).record(size_bytes as f64);
}

/// Sets the memory held by request bodies in the ingress.
pub fn set_ingress_request_memory(bytes: usize) {
    gauge!("microbus_ingress_request_memory_bytes").set(bytes as f64);
}

/// Guard that counts an in-flight request until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Increments the in-flight gauge.
    #[must_use]
    pub fn new() -> Self {
        gauge!("microbus_in_flight_requests").increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!("microbus_in_flight_requests").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.addr.is_none());
        assert!(config.duration_buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_invalid_address() {
        let config = MetricsConfig {
            addr: Some("not an address".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidMetricsAddr { .. })
        ));
    }

    #[test]
    fn test_disabled_metrics() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_record_functions_without_recorder() {
        record_server_request("a.example", 443, "GET", "/x", 200, Duration::from_millis(1));
        record_client_request("a.example", 443, "GET", 404, Duration::from_millis(1));
        record_client_timeout("a.example", 443, "GET");
        record_ingress_response("a.example", 443, "GET", 200, Duration::from_millis(1), 10);
        set_ingress_request_memory(0);
        let guard = InFlightGuard::new();
        drop(guard);
    }
}
