//! Layered loading of [`MicrobusConfig`].

use std::env;
use std::fs;
use std::path::Path;

use microbus_core::Deployment;

use crate::settings::LogFormat;
use crate::{ConfigError, MicrobusConfig};

/// Configuration loader.
///
/// Layers apply in order, later ones overriding earlier ones:
/// 1. Default values
/// 2. Configuration file (YAML or JSON)
/// 3. Environment variables
///
/// # Example
///
/// ```no_run
/// use microbus_config::ConfigLoader;
///
/// # fn main() -> Result<(), microbus_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_dotenv()
///     .with_optional_file("microbus.yaml")?
///     .with_env_prefix("MICROBUS")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: MicrobusConfig,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Creates a loader starting from the default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from a file. The format follows the extension:
    /// `.yaml`/`.yml` or `.json`.
    pub fn with_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::missing_file(path));
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::unreadable(path, e))?;
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => "json",
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                "yaml"
            }
            _ => {
                return Err(ConfigError::rejected(format!(
                    "unsupported configuration file format: {}",
                    path.display()
                )))
            }
        };
        self.with_string(&content, format)
    }

    /// Loads settings from a file if it exists.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Loads settings from a string in the given format (`yaml` or `json`).
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            _ => {
                return Err(ConfigError::rejected(format!(
                    "unsupported configuration format: {format}"
                )))
            }
        };
        Ok(self)
    }

    /// Enables overrides from environment variables named `{PREFIX}_{KEY}`:
    ///
    /// | Variable | Setting |
    /// |---|---|
    /// | `MICROBUS_PLANE` | `plane` |
    /// | `MICROBUS_DEPLOYMENT` | `deployment` |
    /// | `MICROBUS_NATS` | `nats` |
    /// | `MICROBUS_LOG_LEVEL` | `log.level` |
    /// | `MICROBUS_LOG_FORMAT` | `log.format` |
    /// | `MICROBUS_METRICS_ADDR` | `metrics.addr` |
    /// | `MICROBUS_TRACE_SAMPLE_RATIO` | `tracing.sample_ratio` |
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_ascii_uppercase());
        self
    }

    /// Loads variables from a `.env` file in the working directory, if any.
    #[must_use]
    pub fn with_dotenv(self) -> Self {
        let _ = dotenvy::dotenv();
        self
    }

    /// Applies environment overrides and validates the result.
    pub fn load(mut self) -> Result<MicrobusConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            let vars: Vec<(String, String)> = env::vars()
                .filter(|(k, _)| k.starts_with(&prefix))
                .collect();
            for (key, value) in vars {
                self.apply_env_var(&key, &value, &prefix)?;
            }
        }
        self.config.validate()?;
        Ok(self.config)
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(name) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix('_')) else {
            return Ok(());
        };
        let parts: Vec<&str> = name.split('_').collect();

        match parts.as_slice() {
            ["PLANE"] => self.config.plane = value.to_string(),
            ["DEPLOYMENT"] => {
                self.config.deployment = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<Deployment>().map_err(|_| {
                        ConfigError::bad_env(key, "expected LOCAL, TESTING, LAB or PROD")
                    })?)
                };
            }
            ["NATS"] => self.config.nats = value.to_string(),
            ["LOG", "LEVEL"] => self.config.log.level = value.to_string(),
            ["LOG", "FORMAT"] => {
                self.config.log.format = match value.to_ascii_lowercase().as_str() {
                    "" => None,
                    "json" => Some(LogFormat::Json),
                    "pretty" => Some(LogFormat::Pretty),
                    _ => {
                        return Err(ConfigError::bad_env(
                            key,
                            "expected 'json' or 'pretty'",
                        ))
                    }
                };
            }
            ["METRICS", "ADDR"] => {
                self.config.metrics.addr = (!value.is_empty()).then(|| value.to_string());
            }
            ["TRACE", "SAMPLE", "RATIO"] => {
                self.config.tracing.sample_ratio = value
                    .parse()
                    .map_err(|_| ConfigError::bad_env(key, "expected float"))?;
            }
            // Unknown variables under the prefix belong to someone else.
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn apply(loader: &mut ConfigLoader, key: &str, value: &str) -> Result<(), ConfigError> {
        loader.apply_env_var(key, value, "MICROBUS")
    }

    #[test]
    fn test_loader_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config, MicrobusConfig::default());
    }

    #[test]
    fn test_loader_with_yaml_string() {
        let yaml = r"
plane: staging
deployment: LAB
nats: nats://bus:4222
log:
  level: debug
  format: pretty
";
        let config = ConfigLoader::new()
            .with_string(yaml, "yaml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.plane, "staging");
        assert_eq!(config.deployment(), Deployment::Lab);
        assert_eq!(config.nats, "nats://bus:4222");
        assert_eq!(config.log.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn test_loader_rejects_unknown_fields() {
        let result = ConfigLoader::new().with_string("plain: oops", "yaml");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_loader_with_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "plane: fromfile").unwrap();
        let config = ConfigLoader::new()
            .with_file(file.path())
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.plane, "fromfile");
    }

    #[test]
    fn test_loader_missing_files() {
        assert!(matches!(
            ConfigLoader::new().with_file("/nonexistent/microbus.yaml"),
            Err(ConfigError::MissingFile { .. })
        ));
        assert!(ConfigLoader::new()
            .with_optional_file("/nonexistent/microbus.yaml")
            .is_ok());
    }

    #[test]
    fn test_apply_env_vars() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "MICROBUS_PLANE", "alt").unwrap();
        apply(&mut loader, "MICROBUS_DEPLOYMENT", "testing").unwrap();
        apply(&mut loader, "MICROBUS_LOG_FORMAT", "JSON").unwrap();
        apply(&mut loader, "MICROBUS_TRACE_SAMPLE_RATIO", "0.5").unwrap();
        apply(&mut loader, "MICROBUS_SOMETHING_ELSE", "ignored").unwrap();
        let config = loader.load().unwrap();
        assert_eq!(config.plane, "alt");
        assert_eq!(config.deployment(), Deployment::Testing);
        assert_eq!(config.log.format, Some(LogFormat::Json));
        assert!((config.tracing.sample_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_env_var_errors() {
        let mut loader = ConfigLoader::new();
        assert!(matches!(
            apply(&mut loader, "MICROBUS_DEPLOYMENT", "STAGING"),
            Err(ConfigError::BadEnv { .. })
        ));
        assert!(apply(&mut loader, "MICROBUS_LOG_FORMAT", "xml").is_err());
        assert!(apply(&mut loader, "MICROBUS_TRACE_SAMPLE_RATIO", "half").is_err());
    }

    #[test]
    fn test_invalid_plane_fails_load() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "MICROBUS_PLANE", "a.b").unwrap();
        assert!(loader.load().is_err());
    }
}
