//! Translation between external HTTP requests and internal bus requests.
//!
//! The first segment of the external path names the internal host and,
//! optionally, its port: `/hello.example:1234/path?q=1` is forwarded to
//! `https://hello.example:1234/path?q=1`. Without a port the internal port
//! is 443, subject to the port mappings.

use http::header::{self, HeaderMap, HeaderName};
use http::Uri;
use microbus_core::frame::is_control_header;
use microbus_core::ids::validate_hostname;
use microbus_core::{MicrobusError, MicrobusResult, CONTROL_PORT, DEFAULT_PORT};

use crate::portmap::{PortMappings, Resolution};

const TRACE_HEADERS: [&str; 2] = ["traceparent", "tracestate"];

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The internal destination of an external request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Internal host name.
    pub host: String,
    /// Internal port after mapping.
    pub port: u16,
    /// Path and query on the internal host, starting with `/`.
    pub path_and_query: String,
}

impl Target {
    /// The internal URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://{}:{}{}", self.host, self.port, self.path_and_query)
    }
}

/// Resolves the internal destination of a request received on `external_port`.
///
/// Fails with `NotFound` when the path names no valid host or the mapped
/// port may not be reached from outside.
pub fn resolve(uri: &Uri, external_port: u16, mappings: &PortMappings) -> MicrobusResult<Target> {
    let path = uri.path().strip_prefix('/').unwrap_or(uri.path());
    let (segment, rest) = match path.split_once('/') {
        Some((segment, rest)) => (segment, format!("/{rest}")),
        None => (path, "/".to_string()),
    };
    if segment.is_empty() {
        return Err(MicrobusError::not_found("no internal host in path"));
    }

    let (host, port, explicit) = match segment.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| MicrobusError::not_found(format!("invalid port in '{segment}'")))?;
            (host, port, true)
        }
        None => (segment, DEFAULT_PORT, false),
    };
    let host = host.to_ascii_lowercase();
    validate_hostname(&host).map_err(|_| MicrobusError::not_found(format!("invalid host '{host}'")))?;

    let port = match mappings.resolve(external_port, port, explicit) {
        Resolution::Forward(port) => port,
        Resolution::Reject => {
            return Err(MicrobusError::not_found(format!(
                "port {port} is not reachable from port {external_port}"
            )))
        }
    };
    if port == CONTROL_PORT {
        return Err(MicrobusError::not_found("control port is not reachable"));
    }

    let path_and_query = match uri.query() {
        Some(q) => format!("{rest}?{q}"),
        None => rest,
    };
    Ok(Target {
        host,
        port,
        path_and_query,
    })
}

/// Removes headers that must not cross the ingress: control headers, trace
/// context and hop-by-hop headers.
pub fn filter_request_headers(headers: &mut HeaderMap) {
    strip(headers);
    for name in TRACE_HEADERS {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
}

/// Removes control and hop-by-hop headers from a response.
pub fn filter_response_headers(headers: &mut HeaderMap) {
    strip(headers);
}

fn strip(headers: &mut HeaderMap) {
    let control: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_control_header(name.as_str()))
        .cloned()
        .collect();
    for name in control {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
