//! High-level router API.

use crate::node::Node;
use crate::params::Params;
use crate::{RouteMatch, TemplateError};

/// A radix tree mapping path templates to values.
///
/// # Example
///
/// ```rust
/// use microbus_router::Router;
///
/// let mut router = Router::new();
/// router.insert("/users/{id}", "getUser").unwrap();
/// router.insert("/files/{path+}", "serveFile").unwrap();
///
/// let m = router.match_path("/files/images/logo.png").unwrap();
/// assert_eq!(*m.value, "serveFile");
/// assert_eq!(m.params.get("path"), Some("images/logo.png"));
/// ```
///
/// # Priority
///
/// 1. Literal segments (`/users/me`)
/// 2. Single captures (`/users/{id}`)
/// 3. Greedy captures (`/users/{rest+}`)
#[derive(Debug, Clone)]
pub struct Router<T> {
    root: Node<T>,
    route_count: usize,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T> {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::root(),
            route_count: 0,
        }
    }

    /// Inserts a template, returning the value previously bound to it.
    pub fn insert(&mut self, template: &str, value: T) -> Result<Option<T>, TemplateError> {
        let segments = Node::<T>::parse_template(template)?;
        let previous = self.root.insert_segments(&segments, value);
        if previous.is_none() {
            self.route_count += 1;
        }
        Ok(previous)
    }

    /// Removes a template, returning its value.
    pub fn remove(&mut self, template: &str) -> Option<T> {
        let segments = Node::<T>::parse_template(template).ok()?;
        let removed = self.root.remove_segments(&segments);
        if removed.is_some() {
            self.route_count -= 1;
        }
        removed
    }

    /// Matches a concrete path.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<RouteMatch<'_, T>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Params::new();
        let value = self.root.match_segments(&segments, &mut params)?;
        Some(RouteMatch { value, params })
    }

    /// Number of templates.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.route_count
    }

    /// Returns `true` if no template is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.route_count == 0
    }
}
