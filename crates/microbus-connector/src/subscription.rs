//! Subscriptions of a connector.
//!
//! A subscription binds a method and a route to a handler. Routes take one
//! of these forms:
//!
//! | Route | Host | Port |
//! |---|---|---|
//! | `/path` | the connector's host | 443 |
//! | `:1234/path` | the connector's host | 1234 |
//! | `//alt.host:1234/path` | `alt.host` | 1234 |
//! | `https://alt.host:1234/path` | `alt.host` | 1234 |
//!
//! The path may contain `{name}` and `{name+}` captures.

use std::collections::HashMap;
use std::fmt;

use microbus_core::{MicrobusError, MicrobusResult, SharedHandler, DEFAULT_PORT};
use microbus_router::{Params, Router};
use microbus_transport::subject::ANY_METHOD;

/// Queue policy of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Queue {
    /// Load-balanced across the instances of the host, on the queue named
    /// `{host}:{port}:{method}:{path}`.
    #[default]
    Default,
    /// Broadcast to every instance.
    None,
    /// Load-balanced on a named queue.
    Named(String),
}

/// Options of a subscription.
///
/// # Example
///
/// ```
/// use microbus_connector::SubscriptionOptions;
///
/// let opts = SubscriptionOptions::new().no_queue();
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub(crate) queue: Queue,
}

impl SubscriptionOptions {
    /// Default options: load-balanced on the default queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers every message to every instance.
    #[must_use]
    pub fn no_queue(mut self) -> Self {
        self.queue = Queue::None;
        self
    }

    /// Load-balances on a named queue.
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Queue::Named(name.into());
        self
    }
}

/// A parsed route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Path template, starting with `/`.
    pub path: String,
}

impl Route {
    /// Parses a route relative to `default_host`.
    pub fn parse(default_host: &str, route: &str) -> MicrobusResult<Self> {
        let invalid = |reason: &str| MicrobusError::bad_input(format!("invalid route '{route}': {reason}"));

        let rest = route
            .strip_prefix("https://")
            .or_else(|| route.strip_prefix("http://"))
            .map(|r| format!("//{r}"));
        let route_str = rest.as_deref().unwrap_or(route);

        let (host, port, path) = if let Some(authority_path) = route_str.strip_prefix("//") {
            let (authority, path) = match authority_path.find('/') {
                Some(i) => authority_path.split_at(i),
                None => (authority_path, "/"),
            };
            let (host, port) = match authority.rsplit_once(':') {
                Some((h, p)) => (h, parse_port(p).ok_or_else(|| invalid("bad port"))?),
                None => (authority, DEFAULT_PORT),
            };
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            (host.to_ascii_lowercase(), port, path.to_string())
        } else if let Some(port_path) = route_str.strip_prefix(':') {
            let (port, path) = match port_path.find('/') {
                Some(i) => port_path.split_at(i),
                None => (port_path, "/"),
            };
            let port = parse_port(port).ok_or_else(|| invalid("bad port"))?;
            (default_host.to_string(), port, path.to_string())
        } else if route_str.starts_with('/') {
            (default_host.to_string(), DEFAULT_PORT, route_str.to_string())
        } else {
            (default_host.to_string(), DEFAULT_PORT, format!("/{route_str}"))
        };

        Ok(Self { host, port, path })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}:{}{}", self.host, self.port, self.path)
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// A registered subscription.
pub(crate) struct Endpoint {
    pub key: String,
    pub method: String,
    pub route: Route,
    pub queue: Option<String>,
    pub handler: SharedHandler,
}

impl Endpoint {
    pub fn new(method: &str, route: Route, opts: &SubscriptionOptions, handler: SharedHandler) -> Self {
        let method = method.to_ascii_uppercase();
        let queue = match &opts.queue {
            Queue::Default => Some(format!(
                "{}:{}:{}:{}",
                route.host, route.port, method, route.path
            )),
            Queue::None => None,
            Queue::Named(name) => Some(name.clone()),
        };
        Self {
            key: endpoint_key(&method, &route),
            method,
            route,
            queue,
            handler,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("key", &self.key)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

pub(crate) fn endpoint_key(method: &str, route: &Route) -> String {
    format!("{} {route}", method.to_ascii_uppercase())
}

/// Maps `(host, port, method)` and a path to the key of the winning
/// subscription.
#[derive(Debug, Default)]
pub(crate) struct RouteTable {
    routers: HashMap<(String, u16, String), Router<String>>,
}

impl RouteTable {
    pub fn insert(&mut self, endpoint: &Endpoint) -> MicrobusResult<()> {
        let route = &endpoint.route;
        self.routers
            .entry((route.host.clone(), route.port, endpoint.method.clone()))
            .or_default()
            .insert(&route.path, endpoint.key.clone())
            .map_err(|e| MicrobusError::bad_input(format!("invalid path '{}': {e}", route.path)))?;
        Ok(())
    }

    pub fn remove(&mut self, endpoint: &Endpoint) {
        let route = &endpoint.route;
        let table_key = (route.host.clone(), route.port, endpoint.method.clone());
        if let Some(router) = self.routers.get_mut(&table_key) {
            router.remove(&route.path);
            if router.is_empty() {
                self.routers.remove(&table_key);
            }
        }
    }

    /// Finds the subscription handling a request. An exact method match wins
    /// over `ANY`.
    pub fn lookup(&self, host: &str, port: u16, method: &str, path: &str) -> Option<(String, Params)> {
        [method, ANY_METHOD].iter().find_map(|m| {
            let router = self.routers.get(&(host.to_string(), port, (*m).to_string()))?;
            let found = router.match_path(path)?;
            Some((found.value.clone(), found.params))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbus_core::{Context, Request, Response, ResponseExt};
    use std::sync::Arc;

    fn handler() -> SharedHandler {
        Arc::new(|_ctx: Context, _req: Request| async { Ok(Response::text("ok")) })
    }

    #[test]
    fn test_parse_route_forms() {
        let r = Route::parse("me.host", "/echo").unwrap();
        assert_eq!((r.host.as_str(), r.port, r.path.as_str()), ("me.host", 443, "/echo"));

        let r = Route::parse("me.host", ":1234/echo").unwrap();
        assert_eq!((r.host.as_str(), r.port), ("me.host", 1234));

        let r = Route::parse("me.host", "//Alt.Host:888/ping").unwrap();
        assert_eq!((r.host.as_str(), r.port, r.path.as_str()), ("alt.host", 888, "/ping"));

        let r = Route::parse("me.host", "https://other:80/x/{id}").unwrap();
        assert_eq!((r.host.as_str(), r.port, r.path.as_str()), ("other", 80, "/x/{id}"));

        let r = Route::parse("me.host", "echo").unwrap();
        assert_eq!(r.path, "/echo");

        let r = Route::parse("me.host", ":555").unwrap();
        assert_eq!(r.path, "/");
    }

    #[test]
    fn test_parse_route_errors() {
        assert!(Route::parse("me", ":abc/x").is_err());
        assert!(Route::parse("me", ":0/x").is_err());
        assert!(Route::parse("me", "//:443/x").is_err());
    }

    #[test]
    fn test_default_queue_name() {
        let route = Route::parse("me.host", "/echo").unwrap();
        let ep = Endpoint::new("get", route.clone(), &SubscriptionOptions::new(), handler());
        assert_eq!(ep.method, "GET");
        assert_eq!(ep.queue.as_deref(), Some("me.host:443:GET:/echo"));
        assert_eq!(ep.key, "GET https://me.host:443/echo");

        let ep = Endpoint::new("GET", route, &SubscriptionOptions::new().no_queue(), handler());
        assert!(ep.queue.is_none());
    }

    #[test]
    fn test_route_table_prefers_exact_method() {
        let mut table = RouteTable::default();
        let any = Endpoint::new(
            "ANY",
            Route::parse("h", "/items/{id}").unwrap(),
            &SubscriptionOptions::new(),
            handler(),
        );
        let get = Endpoint::new(
            "GET",
            Route::parse("h", "/items/{id}").unwrap(),
            &SubscriptionOptions::new(),
            handler(),
        );
        table.insert(&any).unwrap();
        table.insert(&get).unwrap();

        let (key, params) = table.lookup("h", 443, "GET", "/items/7").unwrap();
        assert_eq!(key, get.key);
        assert_eq!(params.get("id"), Some("7"));

        let (key, _) = table.lookup("h", 443, "POST", "/items/7").unwrap();
        assert_eq!(key, any.key);

        table.remove(&get);
        let (key, _) = table.lookup("h", 443, "GET", "/items/7").unwrap();
        assert_eq!(key, any.key);
        assert!(table.lookup("h", 444, "GET", "/items/7").is_none());
    }
}
