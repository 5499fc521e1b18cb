//! Config properties of the ingress and the tables built from them.

use std::time::Duration;

use microbus_config::{parse_duration, ConfigProperty};
use microbus_connector::Connector;
use microbus_core::{MicrobusError, MicrobusResult};

use crate::middleware::Pipeline;
use crate::portmap::PortMappings;
use crate::stages::{
    AllowedOrigins, BlockedPaths, Compress, Cors, ForwardedHeaders, LanguageMatcher,
    DEFAULT_BLOCKED_PATHS,
};

/// Ports to listen on.
pub const PORTS: &str = "Ports";
/// Default time budget of forwarded requests.
pub const TIME_BUDGET: &str = "TimeBudget";
/// Memory available to request bodies, in MiB.
pub const REQUEST_MEMORY_LIMIT: &str = "RequestMemoryLimit";
/// Origins allowed to make cross-origin requests.
pub const ALLOWED_ORIGINS: &str = "AllowedOrigins";
/// Port mapping rules.
pub const PORT_MAPPINGS: &str = "PortMappings";
/// Languages the server supports.
pub const SERVER_LANGUAGES: &str = "ServerLanguages";
/// Paths to reject.
pub const BLOCKED_PATHS: &str = "BlockedPaths";
/// Time allowed to read a whole request.
pub const READ_TIMEOUT: &str = "ReadTimeout";
/// Time allowed to read the request headers.
pub const READ_HEADER_TIMEOUT: &str = "ReadHeaderTimeout";

const MIB: usize = 1024 * 1024;

/// Declares the config properties of the ingress on its connector.
pub(crate) fn define(con: &Connector) -> MicrobusResult<()> {
    let props = [
        ConfigProperty::new(PORTS, "8080", r"str ^\s*\d{1,5}(\s*,\s*\d{1,5})*\s*$")?
            .with_description("Comma separated list of ports to listen on."),
        ConfigProperty::new(TIME_BUDGET, "20s", "dur [1s,]")?
            .with_description("Time budget of requests forwarded to the bus."),
        ConfigProperty::new(REQUEST_MEMORY_LIMIT, "4096", "int [1,]")?
            .with_description("Memory in MiB available to the bodies of requests in flight."),
        ConfigProperty::new(ALLOWED_ORIGINS, "*", "str")?
            .with_description("Comma separated list of origins allowed for CORS, or * for any."),
        ConfigProperty::new(PORT_MAPPINGS, "8080:*->*, 443:*->443, 80:*->443", "str")?
            .with_description("Rules of the form EXT:INT->TGT mapping external to internal ports."),
        ConfigProperty::new(SERVER_LANGUAGES, "", "str")?
            .with_description("Comma separated list of supported languages. Empty disables matching."),
        ConfigProperty::new(BLOCKED_PATHS, DEFAULT_BLOCKED_PATHS, "str")?
            .with_description("Paths and *.ext patterns that are rejected with 404."),
        ConfigProperty::new(READ_TIMEOUT, "5m", "dur [1s,]")?
            .with_description("Time allowed to read a whole request."),
        ConfigProperty::new(READ_HEADER_TIMEOUT, "20s", "dur [1s,]")?
            .with_description("Time allowed to read the headers of a request."),
    ];
    for prop in props {
        con.define_config(prop)?;
    }
    Ok(())
}

/// Settings of the ingress, parsed from its config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Ports to listen on, deduplicated, in order.
    pub ports: Vec<u16>,
    /// Default time budget of forwarded requests.
    pub time_budget: Duration,
    /// Request memory limit in bytes.
    pub memory_limit: usize,
    /// Port mapping rules.
    pub port_mappings: PortMappings,
    /// Time allowed to read a whole request.
    pub read_timeout: Duration,
    /// Time allowed to read the request headers.
    pub read_header_timeout: Duration,
    allowed_origins: String,
    server_languages: String,
    blocked_paths: String,
}

impl Settings {
    /// Reads the settings from the connector's config.
    pub fn load(con: &Connector) -> MicrobusResult<Self> {
        let mut ports = Vec::new();
        for p in con.config(PORTS).split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let port = p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| MicrobusError::config_invalid(format!("invalid port '{p}'")))?;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        let duration = |name: &str| {
            parse_duration(con.config(name).trim())
                .map_err(|e| MicrobusError::config_invalid(format!("{name}: {e}")))
        };
        let memory_mib = con
            .config_int(REQUEST_MEMORY_LIMIT)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| MicrobusError::config_invalid("invalid RequestMemoryLimit"))?;
        Ok(Self {
            ports,
            time_budget: duration(TIME_BUDGET)?,
            memory_limit: memory_mib.saturating_mul(MIB),
            port_mappings: con.config(PORT_MAPPINGS).parse()?,
            read_timeout: duration(READ_TIMEOUT)?,
            read_header_timeout: duration(READ_HEADER_TIMEOUT)?,
            allowed_origins: con.config(ALLOWED_ORIGINS),
            server_languages: con.config(SERVER_LANGUAGES),
            blocked_paths: con.config(BLOCKED_PATHS),
        })
    }

    /// Returns `true` if the listeners must restart to apply `other`.
    #[must_use]
    pub fn listeners_differ(&self, other: &Self) -> bool {
        self.ports != other.ports
            || self.read_timeout != other.read_timeout
            || self.read_header_timeout != other.read_header_timeout
    }

    /// Builds the middleware pipeline.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        let mut builder = Pipeline::builder()
            .stage(Compress)
            .stage(BlockedPaths::parse(&self.blocked_paths))
            .stage(Cors::new(AllowedOrigins::parse(&self.allowed_origins)));
        let languages = LanguageMatcher::new(&self.server_languages);
        if !languages.is_empty() {
            builder = builder.stage(languages);
        }
        builder.stage(ForwardedHeaders).build()
    }
}
