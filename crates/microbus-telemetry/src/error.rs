//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing logging, metrics or tracing.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter directive does not parse.
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter {
        /// The directive as given.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// Another global subscriber is already installed.
    #[error("log subscriber already installed: {0}")]
    SubscriberInstalled(String),

    /// The scrape listener address does not parse.
    #[error("invalid metrics address '{addr}': {reason}")]
    InvalidMetricsAddr {
        /// The address as given.
        addr: String,
        /// Parser message.
        reason: String,
    },

    /// The Prometheus recorder could not be built or installed.
    #[error("metrics recorder: {0}")]
    Recorder(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TelemetryError::InvalidMetricsAddr {
            addr: "nowhere".to_string(),
            reason: "invalid socket address syntax".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid metrics address 'nowhere': invalid socket address syntax"
        );
        let err = TelemetryError::Recorder("already installed".to_string());
        assert_eq!(err.to_string(), "metrics recorder: already installed");
    }
}
