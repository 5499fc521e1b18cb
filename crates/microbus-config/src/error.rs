//! Errors of process settings and config properties.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to load process settings or to accept a config property value.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A settings file named explicitly does not exist.
    #[error("settings file {path} does not exist")]
    MissingFile {
        /// The file.
        path: PathBuf,
    },

    /// A settings file exists but cannot be read.
    #[error("cannot read settings file {path}")]
    Unreadable {
        /// The file.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Malformed YAML, in a settings file or in `config.yaml`.
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed JSON settings file.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value that its property or setting does not accept.
    #[error("{name}: {reason}")]
    InvalidValue {
        /// Property or setting name.
        name: String,
        /// What is wrong with the value.
        reason: String,
    },

    /// A validation rule that does not parse, such as `int [5,`.
    #[error("validation rule '{rule}': {reason}")]
    InvalidRule {
        /// The rule as written.
        rule: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A `MICROBUS_*` environment variable with an unusable value.
    #[error("environment variable {var}: {reason}")]
    BadEnv {
        /// Variable name.
        var: String,
        /// What is wrong with its value.
        reason: String,
    },

    /// Settings that are individually valid but inconsistent.
    #[error("settings rejected: {0}")]
    Rejected(String),
}

impl ConfigError {
    /// A settings file that does not exist.
    pub fn missing_file(path: impl Into<PathBuf>) -> Self {
        Self::MissingFile { path: path.into() }
    }

    /// A settings file that cannot be read.
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Unreadable {
            path: path.into(),
            source,
        }
    }

    /// A value rejected by the property or setting `name`.
    pub fn invalid_value(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// A validation rule that does not parse.
    pub fn invalid_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// An environment variable with an unusable value.
    pub fn bad_env(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadEnv {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// Inconsistent settings.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

impl From<ConfigError> for microbus_core::MicrobusError {
    #[track_caller]
    fn from(err: ConfigError) -> Self {
        Self::config_invalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid_value("Ports", "not a number");
        assert_eq!(err.to_string(), "Ports: not a number");

        let err = ConfigError::bad_env("MICROBUS_DEPLOYMENT", "unknown deployment 'QA'");
        assert_eq!(
            err.to_string(),
            "environment variable MICROBUS_DEPLOYMENT: unknown deployment 'QA'"
        );
    }

    #[test]
    fn test_into_microbus_error() {
        let err: microbus_core::MicrobusError = ConfigError::rejected("plane is empty").into();
        assert_eq!(err.kind(), microbus_core::ErrorKind::ConfigInvalid);
        assert_eq!(err.message(), "settings rejected: plane is empty");
    }
}
