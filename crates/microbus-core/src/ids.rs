//! Identifiers and host names.

use std::sync::LazyLock;

use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::error::{MicrobusError, MicrobusResult};

static HOSTNAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_\-]+(\.[a-z0-9_\-]+)*$").ok());

/// Generates a random alphanumeric identifier of `len` characters.
#[must_use]
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates a random lower-case alphanumeric identifier, safe for use in
/// host names and bus subjects.
#[must_use]
pub fn random_lower_id(len: usize) -> String {
    random_id(len).to_ascii_lowercase()
}

/// Validates a host name: dot-separated segments of `[a-z0-9_-]`.
///
/// The name is expected to be lower case already.
pub fn validate_hostname(hostname: &str) -> MicrobusResult<()> {
    let valid = hostname.len() <= 253
        && HOSTNAME
            .as_ref()
            .is_some_and(|re| re.is_match(hostname));
    if valid {
        Ok(())
    } else {
        Err(MicrobusError::bad_input(format!(
            "invalid host name '{hostname}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id() {
        let id = random_id(10);
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_id(10), random_id(10));
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("hello.example").is_ok());
        assert!(validate_hostname("configurator.sys").is_ok());
        assert!(validate_hostname("with_under-score.x1").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("bad..dots").is_err());
        assert!(validate_hostname("Upper.case").is_err());
        assert!(validate_hostname("space here").is_err());
        assert!(validate_hostname(".leading").is_err());
    }
}
