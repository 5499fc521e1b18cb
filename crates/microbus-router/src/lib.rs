//! Path-template radix tree for Microbus.
//!
//! Microservices subscribe to path templates made of literal segments,
//! single-segment captures `{name}` and a trailing greedy capture `{name+}`.
//! The connector keeps one [`Router`] per port and method and looks up the
//! path of every incoming request in it.
//!
//! # Example
//!
//! ```rust
//! use microbus_router::Router;
//!
//! let mut router = Router::new();
//! router.insert("/orgs/{org}/users/{user}", "orgUser").unwrap();
//!
//! let m = router.match_path("/orgs/acme/users/123").unwrap();
//! assert_eq!(*m.value, "orgUser");
//! assert_eq!(m.params.get("org"), Some("acme"));
//! assert_eq!(m.params.get("user"), Some("123"));
//! ```
//!
//! # Architecture
//!
//! ```text
//!                    (root)
//!                      │
//!              ┌───────┴───────┐
//!            "orgs"         "files"
//!              │               │
//!            "{org}"       "{path+}"
//!              │
//!           "users"
//!              │
//!           "{user}"
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod node;
mod params;
mod router;

use thiserror::Error;

pub use node::{Node, SegmentKind};
pub use params::Params;
pub use router::Router;

/// A value matched by a path together with the captured arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a, T> {
    /// Value bound to the template
    pub value: &'a T,
    /// Captured arguments
    pub params: Params,
}

/// A malformed path template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// `{name+}` must be the last segment.
    #[error("greedy capture must be the last segment in '{0}'")]
    GreedyNotLast(String),
    /// Capture names are alphanumeric.
    #[error("invalid capture name in '{0}'")]
    InvalidName(String),
    /// A capture must span a whole segment.
    #[error("capture must span a whole segment in '{0}'")]
    PartialCapture(String),
}
