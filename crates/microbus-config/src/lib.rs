//! # Microbus Config
//!
//! Configuration of a Microbus process and of the properties its
//! microservices declare.
//!
//! - [`MicrobusConfig`] - Plane, deployment, bus URL and telemetry settings,
//!   loaded by [`ConfigLoader`] from defaults, an optional YAML or JSON file
//!   and `MICROBUS_*` environment variables
//! - [`ConfigProperty`] - A named config value with a default and a
//!   [`Validation`] rule
//! - [`parse_duration`] - Duration strings such as `1m30s`
//!
//! # Example
//!
//! ```no_run
//! use microbus_config::ConfigLoader;
//!
//! # fn main() -> Result<(), microbus_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_dotenv()
//!     .with_env_prefix("MICROBUS")
//!     .load()?;
//! println!("Plane: {}", config.plane);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod duration;
mod error;
mod loader;
mod property;
mod settings;

pub use duration::{format_duration, parse_duration};
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use property::{parse_bool, ConfigProperty, Validation};
pub use settings::{LogFormat, LogSettings, MetricsSettings, MicrobusConfig, TracingSettings};
