//! Settings of a Microbus process.

use microbus_core::Deployment;
use microbus_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

fn default_plane() -> String {
    "microbus".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_ratio() -> f64 {
    1.0
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines.
    Json,
    /// Human-readable.
    Pretty,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format. Derived from the deployment when not set.
    #[serde(default)]
    pub format: Option<LogFormat>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: None,
        }
    }
}

/// Metrics settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    /// Address of the Prometheus scrape listener. None disables the listener.
    #[serde(default)]
    pub addr: Option<String>,
}

/// Tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingSettings {
    /// Ratio of root spans that are sampled.
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            sample_ratio: default_sample_ratio(),
        }
    }
}

/// Settings of a Microbus process.
///
/// # Example
///
/// ```
/// use microbus_config::MicrobusConfig;
/// use microbus_core::Deployment;
///
/// let config = MicrobusConfig::default();
/// assert_eq!(config.plane, "microbus");
/// assert_eq!(config.deployment(), Deployment::Local);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MicrobusConfig {
    /// Subject namespace of the bus.
    #[serde(default = "default_plane")]
    pub plane: String,

    /// Deployment environment. Derived from `nats` when not set.
    #[serde(default)]
    pub deployment: Option<Deployment>,

    /// NATS URL. Empty selects the in-process bus.
    #[serde(default)]
    pub nats: String,

    /// Logging settings.
    #[serde(default)]
    pub log: LogSettings,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Tracing settings.
    #[serde(default)]
    pub tracing: TracingSettings,
}

impl Default for MicrobusConfig {
    fn default() -> Self {
        Self {
            plane: default_plane(),
            deployment: None,
            nats: String::new(),
            log: LogSettings::default(),
            metrics: MetricsSettings::default(),
            tracing: TracingSettings::default(),
        }
    }
}

impl MicrobusConfig {
    /// The deployment, defaulting to `LOCAL` on the in-process bus and
    /// `PROD` when connected to NATS.
    #[must_use]
    pub fn deployment(&self) -> Deployment {
        self.deployment.unwrap_or(if self.nats.is_empty() {
            Deployment::Local
        } else {
            Deployment::Prod
        })
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plane.is_empty() || !self.plane.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::invalid_value(
                "plane",
                format!("must be alphanumeric: '{}'", self.plane),
            ));
        }
        if !(0.0..=1.0).contains(&self.tracing.sample_ratio) {
            return Err(ConfigError::invalid_value(
                "tracing.sample_ratio",
                "must be between 0.0 and 1.0",
            ));
        }
        if let Some(addr) = &self.metrics.addr {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::invalid_value(
                    "metrics.addr",
                    format!("invalid socket address: {addr}"),
                ));
            }
        }
        Ok(())
    }

    /// Telemetry configuration for a process named `service_name`.
    #[must_use]
    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        let deployment = self.deployment();
        let mut config = TelemetryConfig::new(service_name, deployment)
            .with_log_filter(&self.log.level)
            .with_sample_ratio(self.tracing.sample_ratio);
        if let Some(format) = self.log.format {
            config = config.with_json_logs(format == LogFormat::Json);
        }
        if let Some(addr) = &self.metrics.addr {
            config = config.with_metrics_addr(addr);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_derived_from_nats() {
        let mut config = MicrobusConfig::default();
        assert_eq!(config.deployment(), Deployment::Local);
        config.nats = "nats://127.0.0.1:4222".to_string();
        assert_eq!(config.deployment(), Deployment::Prod);
        config.deployment = Some(Deployment::Lab);
        assert_eq!(config.deployment(), Deployment::Lab);
    }

    #[test]
    fn test_validate_plane() {
        let mut config = MicrobusConfig::default();
        assert!(config.validate().is_ok());
        config.plane = "with.dot".to_string();
        assert!(config.validate().is_err());
        config.plane = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sample_ratio() {
        let mut config = MicrobusConfig::default();
        config.tracing.sample_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_telemetry_log_format() {
        let mut config = MicrobusConfig::default();
        assert!(!config.telemetry("x").logging.json);
        config.log.format = Some(LogFormat::Json);
        assert!(config.telemetry("x").logging.json);
        config.log.level = "debug".to_string();
        assert_eq!(config.telemetry("x").logging.filter, "debug");
    }
}
