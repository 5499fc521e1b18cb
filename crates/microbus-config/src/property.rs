//! Config properties declared by microservices.
//!
//! A property has a name, a default value and a validation rule. Values are
//! always strings; the rule decides which strings are acceptable.
//!
//! # Validation rules
//!
//! | Rule | Accepts |
//! |---|---|
//! | `str` | any string |
//! | `str ^[a-z]+$` | strings matching the regular expression |
//! | `bool` | `true`, `false` (any case) |
//! | `int`, `int [0,100]` | integers, optionally within an inclusive range |
//! | `float`, `float [0.5,]` | numbers, optionally within an inclusive range |
//! | `dur`, `dur [1s,5m]` | durations such as `1m30s` |
//! | `set a\|b\|c` | one of the listed values |
//! | `url` | absolute URLs with a scheme and a host |
//! | `email` | email addresses |
//! | `json` | well-formed JSON |
//!
//! An empty rule is the same as `str`. An empty value is always accepted
//! and means "not set".

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::duration::parse_duration;
use crate::ConfigError;

static EMAIL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").ok()
});

/// A validation rule of a config property.
#[derive(Debug, Clone)]
pub enum Validation {
    /// Any string, or one matching the pattern.
    Str(Option<Regex>),
    /// `true` or `false`.
    Bool,
    /// Integer within the inclusive bounds.
    Int {
        /// Lower bound.
        min: Option<i64>,
        /// Upper bound.
        max: Option<i64>,
    },
    /// Number within the inclusive bounds.
    Float {
        /// Lower bound.
        min: Option<f64>,
        /// Upper bound.
        max: Option<f64>,
    },
    /// Duration within the inclusive bounds.
    Dur {
        /// Lower bound.
        min: Option<Duration>,
        /// Upper bound.
        max: Option<Duration>,
    },
    /// One of a fixed set of values.
    Set(Vec<String>),
    /// Absolute URL.
    Url,
    /// Email address.
    Email,
    /// JSON document.
    Json,
}

impl Validation {
    /// Parses a rule such as `int [1,65535]` or `set a|b|c`.
    pub fn parse(rule: &str) -> Result<Self, ConfigError> {
        let rule = rule.trim();
        let (kind, arg) = match rule.split_once(char::is_whitespace) {
            Some((kind, arg)) => (kind, arg.trim()),
            None => (rule, ""),
        };

        let validation = match kind.to_ascii_lowercase().as_str() {
            "" | "str" | "string" => {
                if arg.is_empty() {
                    Self::Str(None)
                } else {
                    let re = Regex::new(arg)
                        .map_err(|e| ConfigError::invalid_rule(rule, e.to_string()))?;
                    Self::Str(Some(re))
                }
            }
            "bool" | "boolean" => Self::Bool,
            "int" | "integer" => {
                let (min, max) = parse_range(rule, arg, |s| s.parse::<i64>().ok())?;
                Self::Int { min, max }
            }
            "float" | "number" => {
                let (min, max) = parse_range(rule, arg, |s| s.parse::<f64>().ok())?;
                Self::Float { min, max }
            }
            "dur" | "duration" => {
                let (min, max) = parse_range(rule, arg, |s| parse_duration(s).ok())?;
                Self::Dur { min, max }
            }
            "set" => {
                let options: Vec<String> = arg
                    .split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if options.is_empty() {
                    return Err(ConfigError::invalid_rule(rule, "empty set"));
                }
                Self::Set(options)
            }
            "url" => Self::Url,
            "email" => Self::Email,
            "json" => Self::Json,
            other => {
                return Err(ConfigError::invalid_rule(
                    rule,
                    format!("unknown type '{other}'"),
                ))
            }
        };
        Ok(validation)
    }

    /// Checks a value against the rule, returning the reason it fails.
    pub fn check(&self, value: &str) -> Result<(), String> {
        if value.is_empty() {
            return Ok(());
        }
        match self {
            Self::Str(None) => Ok(()),
            Self::Str(Some(re)) => {
                if re.is_match(value) {
                    Ok(())
                } else {
                    Err(format!("does not match '{}'", re.as_str()))
                }
            }
            Self::Bool => parse_bool(value)
                .map(|_| ())
                .ok_or_else(|| "not a boolean".to_string()),
            Self::Int { min, max } => {
                let n = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| "not an integer".to_string())?;
                check_range(&n, min.as_ref(), max.as_ref())
            }
            Self::Float { min, max } => {
                let n = value
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| "not a number".to_string())?;
                check_range(&n, min.as_ref(), max.as_ref())
            }
            Self::Dur { min, max } => {
                let d = parse_duration(value).map_err(|_| "not a duration".to_string())?;
                check_range(&d, min.as_ref(), max.as_ref())
            }
            Self::Set(options) => {
                if options.iter().any(|o| o == value) {
                    Ok(())
                } else {
                    Err(format!("not one of {}", options.join("|")))
                }
            }
            Self::Url => {
                let uri: http::Uri = value.parse().map_err(|_| "not a URL".to_string())?;
                if uri.scheme().is_some() && uri.host().is_some() {
                    Ok(())
                } else {
                    Err("not an absolute URL".to_string())
                }
            }
            Self::Email => match EMAIL.as_ref() {
                Some(re) if re.is_match(value) => Ok(()),
                _ => Err("not an email address".to_string()),
            },
            Self::Json => serde_json::from_str::<serde_json::Value>(value)
                .map(|_| ())
                .map_err(|e| format!("not JSON: {e}")),
        }
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::Str(None)
    }
}

fn parse_range<T>(
    rule: &str,
    arg: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<(Option<T>, Option<T>), ConfigError> {
    if arg.is_empty() {
        return Ok((None, None));
    }
    let inner = arg
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| ConfigError::invalid_rule(rule, "range must be written as [min,max]"))?;
    let (lo, hi) = inner
        .split_once(',')
        .ok_or_else(|| ConfigError::invalid_rule(rule, "range must be written as [min,max]"))?;
    let bound = |s: &str| -> Result<Option<T>, ConfigError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        parse(s)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid_rule(rule, format!("invalid bound '{s}'")))
    };
    Ok((bound(lo)?, bound(hi)?))
}

fn check_range<T: PartialOrd + fmt::Debug>(
    value: &T,
    min: Option<&T>,
    max: Option<&T>,
) -> Result<(), String> {
    if let Some(min) = min {
        if value < min {
            return Err(format!("below minimum {min:?}"));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(format!("above maximum {max:?}"));
        }
    }
    Ok(())
}

/// Parses `true` or `false`, ignoring case.
#[must_use]
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// A config property declared by a microservice.
///
/// # Example
///
/// ```
/// use microbus_config::ConfigProperty;
///
/// let prop = ConfigProperty::new("Ports", "8080", "str ^[0-9]+(,[0-9]+)*$").unwrap()
///     .with_description("Comma-separated list of ports to listen on");
/// assert!(prop.validate("80,443").is_ok());
/// assert!(prop.validate("eighty").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ConfigProperty {
    name: String,
    description: String,
    default_value: String,
    validation: Validation,
    secret: bool,
}

impl ConfigProperty {
    /// Declares a property. Fails if the rule is malformed or the default
    /// value does not satisfy it.
    pub fn new(name: &str, default_value: &str, rule: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::invalid_value(
                name,
                "property names must be alphanumeric",
            ));
        }
        let property = Self {
            name: name.to_string(),
            description: String::new(),
            default_value: default_value.to_string(),
            validation: Validation::parse(rule)?,
            secret: false,
        };
        property.validate(default_value)?;
        Ok(property)
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Marks the value as secret so it is never logged.
    #[must_use]
    pub fn with_secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Name of the property.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description of the property.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Default value.
    #[must_use]
    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    /// Validation rule.
    #[must_use]
    pub const fn validation(&self) -> &Validation {
        &self.validation
    }

    /// Whether the value is secret.
    #[must_use]
    pub const fn is_secret(&self) -> bool {
        self.secret
    }

    /// Validates a value for this property.
    pub fn validate(&self, value: &str) -> Result<(), ConfigError> {
        self.validation
            .check(value)
            .map_err(|reason| ConfigError::invalid_value(&self.name, reason))
    }

    /// The value to log: masked when secret.
    #[must_use]
    pub fn printable<'a>(&self, value: &'a str) -> &'a str {
        if self.secret && !value.is_empty() {
            "*****"
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(rule: &str, value: &str) -> bool {
        Validation::parse(rule).unwrap().check(value).is_ok()
    }

    #[test]
    fn test_str_rule() {
        assert!(ok("str", "anything"));
        assert!(ok("", "anything"));
        assert!(ok("str ^[a-z]+$", "abc"));
        assert!(!ok("str ^[a-z]+$", "ABC"));
    }

    #[test]
    fn test_numeric_rules() {
        assert!(ok("int", "-5"));
        assert!(!ok("int", "5.5"));
        assert!(ok("int [1,65535]", "443"));
        assert!(!ok("int [1,65535]", "0"));
        assert!(ok("int [0,]", "1000000"));
        assert!(ok("float [0.5,1.5]", "1.0"));
        assert!(!ok("float [0.5,1.5]", "2"));
    }

    #[test]
    fn test_duration_rule() {
        assert!(ok("dur", "20s"));
        assert!(ok("dur [1s,1m]", "30s"));
        assert!(!ok("dur [1s,1m]", "2m"));
        assert!(!ok("dur", "soon"));
    }

    #[test]
    fn test_set_and_formats() {
        assert!(ok("set red|green|blue", "green"));
        assert!(!ok("set red|green|blue", "Green"));
        assert!(ok("bool", "TRUE"));
        assert!(!ok("bool", "yes"));
        assert!(ok("url", "https://example.com/path"));
        assert!(!ok("url", "/relative"));
        assert!(ok("email", "someone@example.com"));
        assert!(!ok("email", "someone"));
        assert!(ok("json", r#"{"a":[1,2]}"#));
        assert!(!ok("json", "{"));
    }

    #[test]
    fn test_empty_value_always_valid() {
        assert!(ok("int [1,2]", ""));
        assert!(ok("set a|b", ""));
    }

    #[test]
    fn test_malformed_rules() {
        assert!(Validation::parse("int 1,2").is_err());
        assert!(Validation::parse("int [x,2]").is_err());
        assert!(Validation::parse("set").is_err());
        assert!(Validation::parse("str [").is_err());
        assert!(Validation::parse("color").is_err());
    }

    #[test]
    fn test_property_rejects_invalid_default() {
        assert!(ConfigProperty::new("Port", "99999", "int [1,65535]").is_err());
        assert!(ConfigProperty::new("Bad Name", "", "str").is_err());
        let prop = ConfigProperty::new("Port", "443", "int [1,65535]").unwrap();
        assert_eq!(prop.default_value(), "443");
    }

    #[test]
    fn test_secret_is_masked() {
        let prop = ConfigProperty::new("Password", "", "str").unwrap().with_secret();
        assert_eq!(prop.printable("hunter2"), "*****");
        assert_eq!(prop.printable(""), "");
    }
}
