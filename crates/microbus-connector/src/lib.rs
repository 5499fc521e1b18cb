//! # Microbus Connector
//!
//! The bus endpoint of a microservice.
//!
//! - [`Connector`] - Subscriptions, outgoing calls and lifecycle
//! - Unicast and multicast requests with ack-based responder discovery
//! - Tickers that skip overlapping runs
//! - Config properties fetched from the configurator
//! - [`DistribCache`] - A cache sharded across the instances of a host
//!
//! ## Example
//!
//! ```rust,no_run
//! use microbus_connector::Connector;
//! use microbus_core::{Context, Request, Response, ResponseExt};
//!
//! # async fn run() -> microbus_core::MicrobusResult<()> {
//! let con = Connector::new("hello.example");
//! con.subscribe("GET", "/hello", |_ctx: Context, _req: Request| async {
//!     Ok(Response::text("Hello"))
//! })?;
//! con.startup().await?;
//!
//! let res = con.get(&Context::background(), "https://hello.example/hello").await?;
//! assert_eq!(res.body().as_ref(), b"Hello");
//! con.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/microbus-connector/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod connector;
mod control;
mod dcache;
mod dispatch;
mod lifecycle;
pub mod lru;
mod request;
mod subscription;
mod ticker;

use std::time::Duration;

pub use config::{Changed, ValuesRequest, ValuesResponse, CONFIGURATOR_HOSTNAME};
pub use connector::{ConfigChangedHook, Connector, LifecycleHook, Service, State, WeakConnector};
pub use dcache::{DistribCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use dispatch::catch_panic;
pub use request::{post_json_request, Responses};
pub use subscription::{Queue, Route, SubscriptionOptions};
pub use ticker::TickerHandler;

/// Default time budget of a request.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(20);

/// How long a caller waits for responders to acknowledge a request.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum depth of nested calls before a loop is assumed.
pub const MAX_CALL_DEPTH: u32 = 64;

/// How long shutdown waits for in-flight requests.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Deadline of each startup and shutdown callback.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
