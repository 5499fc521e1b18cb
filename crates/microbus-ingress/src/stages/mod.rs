//! Built-in middleware stages.
//!
//! The ingress runs them in this order:
//!
//! 1. [`Compress`] - compresses textual responses on the way out
//! 2. [`BlockedPaths`] - 404 for paths probed by scanners
//! 3. [`Cors`] - origin checks and preflight responses
//! 4. [`LanguageMatcher`] - rewrites `Accept-Language` to a supported language
//! 5. [`ForwardedHeaders`] - `X-Forwarded-*` headers

pub mod blocked;
pub mod compression;
pub mod cors;
pub mod forwarded;
pub mod language;

pub use blocked::{BlockedPaths, DEFAULT_BLOCKED_PATHS};
pub use compression::{Compress, Encoding};
pub use cors::{AllowedOrigins, Cors};
pub use forwarded::ForwardedHeaders;
pub use language::LanguageMatcher;
