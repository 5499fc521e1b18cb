//! # Microbus Ingress
//!
//! The `http.ingress.sys` microservice: the bridge between external HTTP
//! clients and the microservices on the bus.
//!
//! - Listens on the configured ports, with TLS where a certificate is found
//! - Translates `/{host}[:{port}]/{path}` to the internal URL, applying
//!   port mappings; the control port is never reachable
//! - Caps the memory held by request bodies
//! - Runs a [`middleware`] chain around each request: compression, blocked
//!   paths, CORS, language matching and forwarded headers
//!
//! ## Config
//!
//! | Property | Default |
//! |---|---|
//! | `Ports` | `8080` |
//! | `TimeBudget` | `20s` |
//! | `RequestMemoryLimit` | `4096` (MiB) |
//! | `AllowedOrigins` | `*` |
//! | `PortMappings` | `8080:*->*, 443:*->443, 80:*->443` |
//! | `ServerLanguages` | none |
//! | `BlockedPaths` | common scanner paths |
//! | `ReadTimeout` | `5m` |
//! | `ReadHeaderTimeout` | `20s` |

#![doc(html_root_url = "https://docs.rs/microbus-ingress/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod memory;
pub mod middleware;
pub mod portmap;
mod server;
mod service;
pub mod settings;
pub mod stages;
pub mod translate;

pub use middleware::{IngressContext, IngressRequest, Middleware, Next, Pipeline};
pub use service::{Ingress, INGRESS_HOSTNAME, REQUEST_TIMEOUT_HEADER};
pub use settings::Settings;
