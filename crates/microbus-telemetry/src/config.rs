//! Telemetry configuration of a process.

use microbus_core::Deployment;

use crate::logging::LogConfig;
use crate::metrics::MetricsConfig;
use crate::tracing::TracingConfig;

/// Logging, metrics and tracing settings of one process.
///
/// [`TelemetryConfig::new`] derives everything from the deployment; the
/// `with_*` methods override single settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Name reported in spans.
    pub service_name: String,
    /// Deployment the process runs in.
    pub deployment: Deployment,
    /// Metrics.
    pub metrics: MetricsConfig,
    /// Tracing.
    pub tracing: TracingConfig,
    /// Logging.
    pub logging: LogConfig,
}

impl TelemetryConfig {
    /// Defaults for a process named `service_name` in `deployment`.
    #[must_use]
    pub fn new(service_name: &str, deployment: Deployment) -> Self {
        let tracing = TracingConfig {
            service_name: service_name.to_string(),
            environment: deployment.as_str().to_string(),
            ..TracingConfig::default()
        };
        Self {
            service_name: service_name.to_string(),
            deployment,
            metrics: MetricsConfig::default(),
            tracing,
            logging: LogConfig::for_deployment(deployment),
        }
    }

    /// Replaces the log filter directive.
    #[must_use]
    pub fn with_log_filter(mut self, filter: &str) -> Self {
        self.logging.filter = filter.to_string();
        self
    }

    /// Chooses JSON or pretty log lines regardless of the deployment.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.logging.json = json;
        self
    }

    /// Serves metrics for scraping on `addr`.
    #[must_use]
    pub fn with_metrics_addr(mut self, addr: &str) -> Self {
        self.metrics.enabled = true;
        self.metrics.addr = Some(addr.to_string());
        self
    }

    /// Sets the ratio of root spans that are sampled.
    #[must_use]
    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.tracing.sample_ratio = ratio;
        self
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new("microbus", Deployment::default())
    }
}
