//! Path arguments captured while matching a route.

use smallvec::SmallVec;

/// Most routes capture one or two arguments.
const INLINE_ARGS: usize = 4;

/// `(name, value)` pairs captured by `{name}` and `{name+}` segments, in path
/// order. A greedy capture holds the remaining segments joined by `/`.
///
/// ```rust
/// use microbus_router::Params;
///
/// let params: Params = [("user", "alice"), ("file", "docs/intro.md")]
///     .into_iter()
///     .map(|(k, v)| (k.to_string(), v.to_string()))
///     .collect();
/// assert_eq!(params.get("file"), Some("docs/intro.md"));
/// assert_eq!(params.get("page"), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    args: SmallVec<[(String, String); INLINE_ARGS]>,
}

impl Params {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a captured argument.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.args.push((name.into(), value.into()));
    }

    /// The value captured for `name`. If a route captures the same name
    /// twice, the first capture wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v.as_str()))
    }

    /// True when the route has no captures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Number of captures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// `(name, value)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Forgets the captures made after `mark`, when the matcher backs out of
    /// a branch.
    pub(crate) fn truncate(&mut self, mark: usize) {
        self.args.truncate(mark);
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_capture_wins() {
        let mut params = Params::new();
        assert!(params.is_empty());
        params.push("id", "7");
        params.push("id", "8");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("id"), Some("7"));
    }

    #[test]
    fn test_backtracking_drops_later_captures() {
        let mut params = Params::new();
        params.push("section", "news");
        let mark = params.len();
        params.push("article", "42");
        params.truncate(mark);
        assert_eq!(params.iter().collect::<Vec<_>>(), vec![("section", "news")]);
    }

    #[test]
    fn test_many_captures() {
        let params: Params = (0..9).map(|i| (format!("p{i}"), i.to_string())).collect();
        assert_eq!(params.len(), 9);
        assert_eq!(params.get("p8"), Some("8"));
    }
}
