//! # Microbus
//!
//! **Microservices that talk HTTP over a publish/subscribe bus**
//!
//! Each microservice is built around a [`Connector`] that subscribes HTTP
//! endpoints on bus subjects derived from its host name. Callers address
//! each other with ordinary URLs such as `https://hello.example/greet`; the
//! bus takes care of discovery, load balancing and multicast.
//!
//! - [`Connector`] - Subscriptions, outgoing calls, tickers, config, lifecycle
//! - [`Application`] - Starts and stops microservices together
//! - [`Configurator`] - The `configurator.sys` microservice serving config
//! - [`Ingress`] - The `http.ingress.sys` microservice bridging external HTTP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use microbus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> MicrobusResult<()> {
//!     let hello = Connector::new("hello.example");
//!     hello.subscribe("GET", "/greet", |_ctx: Context, _req: Request| async {
//!         Ok(Response::text("Hello, World!"))
//!     })?;
//!
//!     let app = Application::new();
//!     app.add_service(Configurator::new());
//!     app.add_service(Ingress::new());
//!     app.add_service(hello);
//!     app.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! HTTP client → Ingress → bus ─┬→ hello.example (instance 1)
//!                              └→ hello.example (instance 2)
//! ```

#![doc(html_root_url = "https://docs.rs/microbus/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod application;

pub use application::{Application, DEFAULT_PLANE, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STARTUP_TIMEOUT};

// Re-export the crates of the fabric
pub use microbus_config as config;
pub use microbus_configurator as configurator;
pub use microbus_connector as connector;
pub use microbus_core as core;
pub use microbus_ingress as ingress;
pub use microbus_router as router;
pub use microbus_telemetry as telemetry;
pub use microbus_transport as transport;

pub use microbus_configurator::Configurator;
pub use microbus_connector::Connector;
pub use microbus_ingress::Ingress;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use microbus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::Application;
    pub use microbus_config::ConfigProperty;
    pub use microbus_configurator::Configurator;
    pub use microbus_connector::{Changed, Connector, Service, SubscriptionOptions};
    pub use microbus_core::{
        Context, Deployment, ErrorKind, MicrobusError, MicrobusResult, Request, RequestExt, Response,
        ResponseExt,
    };
    pub use microbus_ingress::Ingress;
}
