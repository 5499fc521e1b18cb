//! Adds `X-Forwarded-*` headers so services can reconstruct the external URL
//! of a request.

use http::header::HOST;
use http::HeaderValue;

use crate::middleware::{BoxFuture, IngressContext, IngressRequest, Middleware, Next, Response};

/// `X-Forwarded-Host` header.
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// `X-Forwarded-Proto` header.
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// `X-Forwarded-For` header.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// `X-Forwarded-Prefix` header.
pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
/// `X-Forwarded-Path` header.
pub const X_FORWARDED_PATH: &str = "x-forwarded-path";

/// The forwarded headers stage.
///
/// Headers set by a proxy in front of the ingress are kept, except that the
/// client address is appended to `X-Forwarded-For`. `X-Forwarded-Prefix` is
/// the external path prefix naming the internal host, e.g. `/hello.example`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedHeaders;

impl ForwardedHeaders {
    fn apply(ctx: &IngressContext, request: &mut IngressRequest) {
        let host = request
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| {
                let authority = request.uri().authority()?;
                HeaderValue::from_str(authority.as_str()).ok()
            });
        let path = request.uri().path().to_string();
        let prefix = path
            .split('/')
            .nth(1)
            .filter(|s| !s.is_empty())
            .map(|s| format!("/{s}"))
            .unwrap_or_default();

        let headers = request.headers_mut();
        if !headers.contains_key(X_FORWARDED_HOST) {
            if let Some(host) = host {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.scheme()));
        }
        if let Some(addr) = ctx.remote_addr() {
            let ip = addr.ip().to_string();
            let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
                _ => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if !headers.contains_key(X_FORWARDED_PREFIX) {
            if let Ok(value) = HeaderValue::from_str(&prefix) {
                headers.insert(X_FORWARDED_PREFIX, value);
            }
        }
        if !headers.contains_key(X_FORWARDED_PATH) {
            if let Ok(value) = HeaderValue::from_str(&path) {
                headers.insert(X_FORWARDED_PATH, value);
            }
        }
    }
}

impl Middleware for ForwardedHeaders {
    fn name(&self) -> &'static str {
        "forwarded"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        mut request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            Self::apply(ctx, &mut request);
            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{context, request};

    #[test]
    fn test_headers_are_added() {
        let mut req = request("GET", "/hello.example/greet?name=x", &[("host", "www.example.com:8080")]);
        ForwardedHeaders::apply(&context(), &mut req);
        let h = req.headers();
        assert_eq!(h[X_FORWARDED_HOST], "www.example.com:8080");
        assert_eq!(h[X_FORWARDED_PROTO], "http");
        assert_eq!(h[X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(h[X_FORWARDED_PREFIX], "/hello.example");
        assert_eq!(h[X_FORWARDED_PATH], "/hello.example/greet");
    }

    #[test]
    fn test_existing_headers_are_kept() {
        let mut req = request(
            "GET",
            "/hello.example/greet",
            &[
                ("host", "internal:8080"),
                ("x-forwarded-host", "www.example.com"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-for", "1.2.3.4"),
            ],
        );
        ForwardedHeaders::apply(&context(), &mut req);
        let h = req.headers();
        assert_eq!(h[X_FORWARDED_HOST], "www.example.com");
        assert_eq!(h[X_FORWARDED_PROTO], "https");
        assert_eq!(h[X_FORWARDED_FOR], "1.2.3.4, 10.0.0.7");
    }
}
