//! Config properties of a microservice.
//!
//! Properties are declared with [`Connector::define_config`] before startup.
//! At startup, and whenever the configurator pushes a refresh, the connector
//! fetches the values of all declared properties from `configurator.sys` in
//! one call.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use microbus_config::{parse_bool, parse_duration, ConfigProperty};
use microbus_core::{Context, Deployment, MicrobusError, MicrobusResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Connector;

/// Host name of the configurator.
pub const CONFIGURATOR_HOSTNAME: &str = "configurator.sys";

#[derive(Debug, Clone)]
pub(crate) struct ConfigEntry {
    pub property: ConfigProperty,
    pub value: String,
}

/// Request body of `POST https://configurator.sys/values`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuesRequest {
    /// Names of the properties, lower case.
    pub names: Vec<String>,
}

/// Response body of `POST https://configurator.sys/values`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuesResponse {
    /// Values of the properties that are set.
    pub values: HashMap<String, String>,
}

/// Names of config properties whose values changed.
#[derive(Debug, Clone, Default)]
pub struct Changed {
    names: HashSet<String>,
}

impl Changed {
    /// Returns `true` if the property changed. Case-insensitive.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names of the changed properties.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Connector {
    /// Declares a config property. Only allowed before startup.
    pub fn define_config(&self, property: ConfigProperty) -> MicrobusResult<()> {
        self.ensure_unstarted("define config")?;
        let key = property.name().to_ascii_lowercase();
        let mut configs = self.inner.configs.write();
        if configs.contains_key(&key) {
            return Err(MicrobusError::bad_input(format!(
                "config '{}' already defined",
                property.name()
            )));
        }
        let value = property.default_value().to_string();
        configs.insert(key, ConfigEntry { property, value });
        Ok(())
    }

    /// Current value of a config property. Empty if undefined.
    #[must_use]
    pub fn config(&self, name: &str) -> String {
        self.inner
            .configs
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    /// Value of a `bool` property.
    #[must_use]
    pub fn config_bool(&self, name: &str) -> bool {
        parse_bool(&self.config(name)).unwrap_or(false)
    }

    /// Value of an `int` property.
    #[must_use]
    pub fn config_int(&self, name: &str) -> Option<i64> {
        self.config(name).trim().parse().ok()
    }

    /// Value of a `dur` property.
    #[must_use]
    pub fn config_duration(&self, name: &str) -> Option<Duration> {
        parse_duration(self.config(name).trim()).ok()
    }

    /// Sets a config value. Allowed before startup, and afterwards only in
    /// `LOCAL` and `TESTING` deployments.
    pub async fn set_config(&self, name: &str, value: &str) -> MicrobusResult<()> {
        let started = self.state() != crate::State::Unstarted;
        if started && !matches!(self.deployment(), Deployment::Local | Deployment::Testing) {
            return Err(MicrobusError::forbidden(format!(
                "cannot set config in {} deployment",
                self.deployment()
            )));
        }
        let key = name.to_ascii_lowercase();
        let changed = {
            let mut configs = self.inner.configs.write();
            let entry = configs
                .get_mut(&key)
                .ok_or_else(|| MicrobusError::not_found(format!("config '{name}' is not defined")))?;
            entry.property.validate(value)?;
            if entry.value == value {
                false
            } else {
                entry.value = value.to_string();
                true
            }
        };
        if changed && started {
            let mut names = HashSet::new();
            names.insert(key);
            self.fire_config_changed(Changed { names }).await?;
        }
        Ok(())
    }

    /// Fetches all declared values from the configurator and applies them.
    ///
    /// At startup an invalid value fails with `ConfigInvalid`; on refresh it
    /// is logged and the previous value kept. Values are kept as they are
    /// when no configurator responds.
    pub(crate) async fn fetch_config(&self, ctx: &Context, at_startup: bool) -> MicrobusResult<()> {
        let names: Vec<String> = self.inner.configs.read().keys().cloned().collect();
        if names.is_empty() || self.hostname() == CONFIGURATOR_HOSTNAME {
            return Ok(());
        }

        let url = format!("https://{CONFIGURATOR_HOSTNAME}:443/values");
        let fetched = match self.post_json(ctx, &url, &ValuesRequest { names }).await {
            Ok(res) => serde_json::from_slice::<ValuesResponse>(res.body())
                .map_err(|e| MicrobusError::internal(format!("invalid config response: {e}")))?
                .values,
            Err(e) if e.status_code() == http::StatusCode::NOT_FOUND => {
                debug!(host = %self.hostname(), "No configurator, keeping config values");
                return Ok(());
            }
            Err(e) if at_startup => {
                warn!(host = %self.hostname(), error = %e, "Failed to fetch config, keeping config values");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut changed = HashSet::new();
        {
            let mut configs = self.inner.configs.write();
            for (key, entry) in configs.iter_mut() {
                // Unset values revert to the default on refresh
                let value = match fetched.get(key) {
                    Some(v) => v.clone(),
                    None if at_startup => continue,
                    None => entry.property.default_value().to_string(),
                };
                if let Err(e) = entry.property.validate(&value) {
                    if at_startup {
                        return Err(MicrobusError::config_invalid(e.to_string()));
                    }
                    warn!(host = %self.hostname(), config = %entry.property.name(), error = %e, "Ignoring invalid config value");
                    continue;
                }
                if entry.value != value {
                    info!(
                        host = %self.hostname(),
                        config = %entry.property.name(),
                        value = %entry.property.printable(&value),
                        "Config value set"
                    );
                    entry.value = value;
                    changed.insert(key.clone());
                }
            }
        }

        if !at_startup && !changed.is_empty() {
            self.fire_config_changed(Changed { names: changed }).await?;
        }
        Ok(())
    }

    /// Re-fetches config values, invoking the config changed callbacks if
    /// any changed.
    pub async fn refresh_config(&self, ctx: &Context) -> MicrobusResult<()> {
        self.fetch_config(ctx, false).await
    }

    async fn fire_config_changed(&self, changed: Changed) -> MicrobusResult<()> {
        let hooks = self.inner.hooks.read().on_config_changed.clone();
        let ctx = self.lifetime().with_timeout(self.time_budget());
        for hook in hooks {
            hook(ctx.clone(), changed.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn property(name: &str, default: &str, rule: &str) -> ConfigProperty {
        ConfigProperty::new(name, default, rule).unwrap()
    }

    #[test]
    fn test_define_and_read_config() {
        let con = Connector::new("config.example");
        con.define_config(property("Enabled", "true", "bool")).unwrap();
        con.define_config(property("Count", "5", "int [1,10]")).unwrap();
        con.define_config(property("Wait", "1m30s", "dur")).unwrap();
        assert!(con.define_config(property("count", "1", "int")).is_err());

        assert!(con.config_bool("enabled"));
        assert_eq!(con.config_int("COUNT"), Some(5));
        assert_eq!(con.config_duration("Wait"), Some(Duration::from_secs(90)));
        assert_eq!(con.config("undefined"), "");
    }

    #[tokio::test]
    async fn test_set_config_validates() {
        let con = Connector::new("config.example");
        con.define_config(property("Count", "5", "int [1,10]")).unwrap();
        con.set_config("count", "7").await.unwrap();
        assert_eq!(con.config("Count"), "7");
        assert!(con.set_config("count", "11").await.is_err());
        assert!(con.set_config("missing", "1").await.is_err());
    }

    #[tokio::test]
    async fn test_set_config_before_startup_does_not_fire() {
        let con = Connector::new("config.example");
        con.define_config(property("Count", "5", "int")).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        con.on_config_changed(move |_ctx, changed| {
            let counter = Arc::clone(&counter);
            async move {
                assert!(changed.contains("COUNT"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        con.set_config("count", "6").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_changed_is_case_insensitive() {
        let mut names = HashSet::new();
        names.insert("timebudget".to_string());
        let changed = Changed { names };
        assert!(changed.contains("TimeBudget"));
        assert!(!changed.contains("Ports"));
        assert!(!changed.is_empty());
    }
}
