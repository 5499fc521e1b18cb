//! Mapping of external ports to internal ports.
//!
//! A rule `EXT:INT->TGT` applies to requests arriving on external port `EXT`
//! that address internal port `INT`, and rewrites the internal port to `TGT`.
//! Any of the three may be `*`. Rules are looked up in this order:
//!
//! 1. `EXT:INT`
//! 2. `*:INT`
//! 3. `EXT:*`
//! 4. `*:*`
//!
//! A target of `*` keeps the internal port. A rule with a wildcard internal
//! port and a concrete target forces the target, so a request that names a
//! different internal port explicitly is rejected.

use std::fmt;

use indexmap::IndexMap;
use microbus_config::ConfigError;

/// One side of a port mapping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    /// Matches any port.
    Any,
    /// A specific port.
    Port(u16),
}

impl PortSpec {
    fn parse(s: &str, rule: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::Any);
        }
        s.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .map(Self::Port)
            .ok_or_else(|| ConfigError::invalid_value("PortMappings", format!("invalid port '{s}' in '{rule}'")))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Port(p) => write!(f, "{p}"),
        }
    }
}

/// Outcome of resolving an internal port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Forward to this internal port.
    Forward(u16),
    /// The request may not reach the internal port.
    Reject,
}

/// Ordered port mapping rules.
///
/// # Example
///
/// ```
/// use microbus_ingress::portmap::{PortMappings, Resolution};
///
/// let mappings: PortMappings = "8080:*->*, 443:*->443".parse().unwrap();
/// assert_eq!(mappings.resolve(8080, 1234, true), Resolution::Forward(1234));
/// assert_eq!(mappings.resolve(443, 443, false), Resolution::Forward(443));
/// assert_eq!(mappings.resolve(443, 555, true), Resolution::Reject);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMappings {
    rules: IndexMap<(PortSpec, PortSpec), PortSpec>,
}

impl PortMappings {
    /// Resolves the internal port of a request arriving on `external`.
    ///
    /// `explicit` tells whether the client named the internal port or it
    /// defaulted.
    #[must_use]
    pub fn resolve(&self, external: u16, internal: u16, explicit: bool) -> Resolution {
        let keys = [
            (PortSpec::Port(external), PortSpec::Port(internal)),
            (PortSpec::Any, PortSpec::Port(internal)),
            (PortSpec::Port(external), PortSpec::Any),
            (PortSpec::Any, PortSpec::Any),
        ];
        for key in keys {
            let Some(target) = self.rules.get(&key) else {
                continue;
            };
            return match (key.1, *target) {
                (_, PortSpec::Any) => Resolution::Forward(internal),
                (PortSpec::Port(_), PortSpec::Port(t)) => Resolution::Forward(t),
                (PortSpec::Any, PortSpec::Port(t)) if explicit && internal != t => Resolution::Reject,
                (PortSpec::Any, PortSpec::Port(t)) => Resolution::Forward(t),
            };
        }
        Resolution::Forward(internal)
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::str::FromStr for PortMappings {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = IndexMap::new();
        for rule in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (from, to) = rule
                .split_once("->")
                .ok_or_else(|| ConfigError::invalid_value("PortMappings", format!("missing '->' in '{rule}'")))?;
            let (ext, int) = from
                .split_once(':')
                .ok_or_else(|| ConfigError::invalid_value("PortMappings", format!("missing ':' in '{rule}'")))?;
            let key = (PortSpec::parse(ext, rule)?, PortSpec::parse(int, rule)?);
            // The first rule for a key wins
            rules.entry(key).or_insert(PortSpec::parse(to, rule)?);
        }
        Ok(Self { rules })
    }
}

impl fmt::Display for PortMappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ((ext, int), tgt)) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ext}:{int}->{tgt}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mappings(s: &str) -> PortMappings {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_mappings() {
        let m = mappings("8080:*->*, 443:*->443, 80:*->443");
        assert_eq!(m.len(), 3);
        assert_eq!(m.resolve(8080, 443, false), Resolution::Forward(443));
        assert_eq!(m.resolve(8080, 1234, true), Resolution::Forward(1234));
        assert_eq!(m.resolve(443, 443, false), Resolution::Forward(443));
        assert_eq!(m.resolve(80, 443, false), Resolution::Forward(443));
        assert_eq!(m.resolve(80, 1234, true), Resolution::Reject);
        // No rule for the external port
        assert_eq!(m.resolve(9090, 1234, true), Resolution::Forward(1234));
    }

    #[test]
    fn test_precedence() {
        let m = mappings("*:*->1, 5000:*->2, *:600->3, 5000:600->4");
        assert_eq!(m.resolve(5000, 600, true), Resolution::Forward(4));
        assert_eq!(m.resolve(7000, 600, true), Resolution::Forward(3));
        assert_eq!(m.resolve(5000, 2, true), Resolution::Forward(2));
        assert_eq!(m.resolve(5000, 700, false), Resolution::Forward(2));
        assert_eq!(m.resolve(7000, 1, true), Resolution::Forward(1));
        assert_eq!(m.resolve(7000, 700, false), Resolution::Forward(1));
    }

    #[test]
    fn test_concrete_internal_port_always_rewrites() {
        let m = mappings("4443:555->443");
        assert_eq!(m.resolve(4443, 555, true), Resolution::Forward(443));
    }

    #[test]
    fn test_invalid_rules() {
        assert!("8080->443".parse::<PortMappings>().is_err());
        assert!("8080:*".parse::<PortMappings>().is_err());
        assert!("x:*->*".parse::<PortMappings>().is_err());
        assert!("0:*->*".parse::<PortMappings>().is_err());
        assert!("".parse::<PortMappings>().unwrap().is_empty());
    }

    #[test]
    fn test_display_round_trip() {
        let m = mappings(" 8080:*->* ,443:*->443");
        assert_eq!(m.to_string(), "8080:*->*, 443:*->443");
    }

    fn port_token() -> impl Strategy<Value = String> {
        prop_oneof![Just("*".to_string()), (1u16..8).prop_map(|p| p.to_string())]
    }

    proptest! {
        #[test]
        fn test_resolution_is_deterministic(
            rules in proptest::collection::vec((port_token(), port_token(), port_token()), 0..8),
            external in 1u16..8,
            internal in 1u16..8,
            explicit in any::<bool>(),
        ) {
            let text: Vec<String> = rules.iter().map(|(e, i, t)| format!("{e}:{i}->{t}")).collect();
            let m = mappings(&text.join(","));
            let first = m.resolve(external, internal, explicit);
            prop_assert_eq!(first, m.resolve(external, internal, explicit));

            // Reparsing the printed rules resolves identically
            let reparsed = mappings(&m.to_string());
            prop_assert_eq!(first, reparsed.resolve(external, internal, explicit));

            // The exact rule, when present, decides
            if let Some(PortSpec::Port(t)) = m.rules.get(&(PortSpec::Port(external), PortSpec::Port(internal))) {
                prop_assert_eq!(first, Resolution::Forward(*t));
            }
        }
    }
}
