//! # Microbus Configurator
//!
//! The `configurator.sys` microservice and its [`Repository`].
//!
//! The configurator loads `config.yaml` and `config.local.yaml` at startup
//! and answers the `values` requests each microservice makes when it starts
//! or is told to refresh. Several configurators sync their repositories,
//! the newer one winning.
//!
//! ```yaml
//! www.example.com:
//!   Greeting: Welcome
//! example.com:
//!   Greeting: Hello
//! all:
//!   TimeBudget: 30s
//! ```

#![doc(html_root_url = "https://docs.rs/microbus-configurator/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod repository;
mod service;

pub use repository::{Repository, ALL_DOMAIN};
pub use service::{Configurator, SyncRequest, CONFIG_FILES, DEFAULT_REFRESH_INTERVAL};
