//! Timestamped config repository with suffix-match lookup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use microbus_config::ConfigError;
use serde::{Deserialize, Serialize};

/// Domain whose values apply to every host.
pub const ALL_DOMAIN: &str = "all";

/// Values of config properties, organized by domain.
///
/// A domain is a host name or a suffix of one. The value of a property for
/// a host is taken from the most specific domain that sets it, falling back
/// to [`ALL_DOMAIN`].
///
/// # Example
///
/// ```rust
/// use microbus_configurator::Repository;
///
/// let mut repo = Repository::new();
/// repo.set("example.com", "Greeting", "Hello");
/// repo.set("www.example.com", "Greeting", "Welcome");
/// assert_eq!(repo.value("www.example.com", "greeting"), Some("Welcome"));
/// assert_eq!(repo.value("api.example.com", "greeting"), Some("Hello"));
/// assert_eq!(repo.value("example.org", "greeting"), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    values: BTreeMap<String, BTreeMap<String, String>>,
    timestamp: DateTime<Utc>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    /// Creates an empty repository stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Sets a value. An empty value deletes it. Domain and name are folded
    /// to lower case and trimmed.
    pub fn set(&mut self, domain: &str, name: &str, value: &str) {
        let domain = normalize(domain);
        let name = normalize(name);
        if value.is_empty() {
            if let Some(props) = self.values.get_mut(&domain) {
                props.remove(&name);
                if props.is_empty() {
                    self.values.remove(&domain);
                }
            }
        } else {
            self.values
                .entry(domain)
                .or_default()
                .insert(name, value.to_string());
        }
        self.timestamp = Utc::now();
    }

    /// Value of a property for a host.
    #[must_use]
    pub fn value(&self, host: &str, name: &str) -> Option<&str> {
        let host = normalize(host);
        let name = normalize(name);
        let mut domain = host.as_str();
        loop {
            if let Some(value) = self.values.get(domain).and_then(|p| p.get(&name)) {
                return Some(value);
            }
            match domain.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => domain = parent,
                _ => break,
            }
        }
        self.values
            .get(ALL_DOMAIN)
            .and_then(|p| p.get(&name))
            .map(String::as_str)
    }

    /// Loads values from YAML of the form `{domain: {name: value}}`,
    /// merging them over the existing values.
    pub fn load_yaml(&mut self, yaml: &str) -> Result<(), ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(());
        }
        let doc: BTreeMap<String, Option<BTreeMap<String, serde_yaml::Value>>> =
            serde_yaml::from_str(yaml)?;
        for (domain, props) in doc {
            for (name, value) in props.unwrap_or_default() {
                let value = scalar_to_string(&domain, &name, value)?;
                self.set(&domain, &name, &value);
            }
        }
        Ok(())
    }

    /// Returns `true` if both repositories hold the same values, regardless
    /// of their timestamps.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.values == other.values
    }

    /// When the repository was last changed.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// All values, by domain.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.values.clone()
    }

    /// Builds a repository from values and a timestamp.
    #[must_use]
    pub fn from_map(values: BTreeMap<String, BTreeMap<String, String>>, timestamp: DateTime<Utc>) -> Self {
        let mut repo = Self::new();
        for (domain, props) in values {
            for (name, value) in props {
                repo.set(&domain, &name, &value);
            }
        }
        repo.timestamp = timestamp;
        repo
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn scalar_to_string(domain: &str, name: &str, value: serde_yaml::Value) -> Result<String, ConfigError> {
    use serde_yaml::Value;
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => Err(ConfigError::invalid_value(
            format!("{domain}.{name}"),
            "value must be a scalar",
        )),
    }
}
