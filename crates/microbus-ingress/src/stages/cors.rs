//! CORS (Cross-Origin Resource Sharing).
//!
//! Requests without an `Origin` header pass through untouched. Requests from
//! an origin that is not allowed are rejected with 403. Preflight requests
//! from an allowed origin are answered with 204 without reaching the bus.

use std::collections::HashSet;

use http::{header, HeaderValue, Method, StatusCode};
use microbus_core::ResponseExt;

use crate::middleware::{BoxFuture, IngressContext, IngressRequest, Middleware, Next, Response};

/// CORS header names.
pub mod headers {
    /// `Access-Control-Allow-Origin` header.
    pub const ALLOW_ORIGIN: &str = "access-control-allow-origin";
    /// `Access-Control-Allow-Methods` header.
    pub const ALLOW_METHODS: &str = "access-control-allow-methods";
    /// `Access-Control-Allow-Headers` header.
    pub const ALLOW_HEADERS: &str = "access-control-allow-headers";
    /// `Access-Control-Allow-Credentials` header.
    pub const ALLOW_CREDENTIALS: &str = "access-control-allow-credentials";
    /// `Access-Control-Max-Age` header.
    pub const MAX_AGE: &str = "access-control-max-age";
    /// `Access-Control-Expose-Headers` header.
    pub const EXPOSE_HEADERS: &str = "access-control-expose-headers";
    /// `Access-Control-Request-Method` header.
    pub const REQUEST_METHOD: &str = "access-control-request-method";
    /// `Access-Control-Request-Headers` header.
    pub const REQUEST_HEADERS: &str = "access-control-request-headers";
}

const PREFLIGHT_MAX_AGE: &str = "86400";

/// Origins allowed to make cross-origin requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// Any origin.
    Any,
    /// Only the listed origins, lower case.
    List(HashSet<String>),
}

impl AllowedOrigins {
    /// Parses a comma separated list of origins. `*` allows any origin.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        let origins: HashSet<String> = list
            .split(',')
            .map(|o| o.trim().trim_end_matches('/').to_ascii_lowercase())
            .filter(|o| !o.is_empty())
            .collect();
        if origins.contains("*") {
            Self::Any
        } else {
            Self::List(origins)
        }
    }

    /// Returns `true` if the origin is allowed.
    #[must_use]
    pub fn is_allowed(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::List(origins) => origins.contains(&origin.trim_end_matches('/').to_ascii_lowercase()),
        }
    }
}

/// The CORS stage.
#[derive(Debug, Clone)]
pub struct Cors {
    origins: AllowedOrigins,
}

impl Cors {
    /// Creates the stage.
    #[must_use]
    pub const fn new(origins: AllowedOrigins) -> Self {
        Self { origins }
    }

    fn is_preflight(request: &IngressRequest) -> bool {
        request.method() == Method::OPTIONS && request.headers().contains_key(headers::REQUEST_METHOD)
    }

    fn preflight_response(request: &IngressRequest, origin: &HeaderValue) -> Response {
        let mut res = Response::empty(StatusCode::NO_CONTENT);
        let h = res.headers_mut();
        h.insert(headers::ALLOW_ORIGIN, origin.clone());
        h.insert(headers::ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        h.insert(headers::MAX_AGE, HeaderValue::from_static(PREFLIGHT_MAX_AGE));
        if let Some(method) = request.headers().get(headers::REQUEST_METHOD) {
            h.insert(headers::ALLOW_METHODS, method.clone());
        }
        if let Some(requested) = request.headers().get(headers::REQUEST_HEADERS) {
            h.insert(headers::ALLOW_HEADERS, requested.clone());
        }
        h.append(header::VARY, HeaderValue::from_static("Origin"));
        res
    }

    fn add_cors_headers(response: &mut Response, origin: HeaderValue) {
        let h = response.headers_mut();
        h.insert(headers::ALLOW_ORIGIN, origin);
        h.insert(headers::ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        h.insert(headers::EXPOSE_HEADERS, HeaderValue::from_static("*"));
        h.append(header::VARY, HeaderValue::from_static("Origin"));
    }
}

impl Middleware for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let Some(origin) = request.headers().get(header::ORIGIN).cloned() else {
                return next.run(ctx, request).await;
            };
            let allowed = origin.to_str().is_ok_and(|o| self.origins.is_allowed(o));
            if !allowed {
                tracing::debug!(origin = ?origin, "Origin not allowed");
                return Response::empty(StatusCode::FORBIDDEN);
            }
            if Self::is_preflight(&request) {
                return Self::preflight_response(&request, &origin);
            }
            let mut response = next.run(ctx, request).await;
            Self::add_cors_headers(&mut response, origin);
            response
        })
    }
}
