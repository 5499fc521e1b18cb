//! Deployment environment label.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The environment a microservice runs in.
///
/// `LOCAL` and `TESTING` enable debug behaviors such as returning error
/// stacks to callers and allowing configuration to be set in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Deployment {
    /// A developer machine.
    #[default]
    Local,
    /// Automated tests.
    Testing,
    /// A shared non-production environment.
    Lab,
    /// Production.
    Prod,
}

impl Deployment {
    /// Returns `true` for `LOCAL` and `TESTING`.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        matches!(self, Self::Local | Self::Testing)
    }

    /// Returns the upper-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Testing => "TESTING",
            Self::Lab => "LAB",
            Self::Prod => "PROD",
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a deployment name is not recognized.
#[derive(Debug, Error)]
#[error("invalid deployment '{0}', expected LOCAL, TESTING, LAB or PROD")]
pub struct ParseDeploymentError(String);

impl FromStr for Deployment {
    type Err = ParseDeploymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Self::Local),
            "TESTING" => Ok(Self::Testing),
            "LAB" => Ok(Self::Lab),
            "PROD" => Ok(Self::Prod),
            _ => Err(ParseDeploymentError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("prod".parse::<Deployment>().unwrap(), Deployment::Prod);
        assert_eq!(" Testing ".parse::<Deployment>().unwrap(), Deployment::Testing);
        assert!("staging".parse::<Deployment>().is_err());
    }

    #[test]
    fn test_is_debug() {
        assert!(Deployment::Local.is_debug());
        assert!(Deployment::Testing.is_debug());
        assert!(!Deployment::Lab.is_debug());
        assert!(!Deployment::Prod.is_debug());
    }
}
