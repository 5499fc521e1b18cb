//! The middleware chain of the ingress.
//!
//! Every external request flows through an ordered list of [`Middleware`]
//! stages before it is forwarded to the bus. Each stage receives the
//! request and a [`Next`] to continue the chain, and may short-circuit by
//! returning its own response. Stages see the response on the way back out.
//!
//! ```ignore
//! struct Timing;
//!
//! impl Middleware for Timing {
//!     fn name(&self) -> &'static str {
//!         "timing"
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         ctx: &'a mut IngressContext,
//!         request: IngressRequest,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, Response> {
//!         Box::pin(async move {
//!             let response = next.run(ctx, request).await;
//!             tracing::debug!(elapsed = ?ctx.elapsed(), "Done");
//!             response
//!         })
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
pub use microbus_core::{BoxFuture, Response};

/// Body of an external request.
pub type IngressBody = BoxBody<Bytes, hyper::Error>;

/// An external request as seen by the middleware.
pub type IngressRequest = http::Request<IngressBody>;

/// Wraps bytes as a request body.
pub fn full_body(bytes: impl Into<Bytes>) -> IngressBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Connection details of an external request.
#[derive(Debug, Clone)]
pub struct IngressContext {
    port: u16,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    started: Instant,
}

impl IngressContext {
    /// Creates the context of a request received on `port`.
    #[must_use]
    pub fn new(port: u16, remote_addr: Option<SocketAddr>, secure: bool) -> Self {
        Self {
            port,
            remote_addr,
            secure,
            started: Instant::now(),
        }
    }

    /// The external port the request arrived on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Address of the client.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the connection is TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// `https` or `http`.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Time since the request was received.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A stage of the ingress middleware chain.
///
/// A stage must call `next.run()` at most once. Not calling it
/// short-circuits the chain.
pub trait Middleware: Send + Sync + 'static {
    /// Name of the stage, for logs.
    fn name(&self) -> &'static str;

    /// Processes the request, usually by delegating to `next`.
    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response>;
}

type Endpoint<'a> =
    Box<dyn FnOnce(&mut IngressContext, IngressRequest) -> BoxFuture<'static, Response> + Send + 'a>;

/// The remainder of the chain.
pub struct Next<'a> {
    inner: NextInner<'a>,
}

enum NextInner<'a> {
    Chain {
        middleware: &'a dyn Middleware,
        next: Box<Next<'a>>,
    },
    Endpoint(Endpoint<'a>),
}

impl<'a> Next<'a> {
    pub(crate) fn new(middleware: &'a dyn Middleware, next: Next<'a>) -> Self {
        Self {
            inner: NextInner::Chain {
                middleware,
                next: Box::new(next),
            },
        }
    }

    /// Creates a chain that ends at `endpoint`.
    pub fn endpoint<F>(endpoint: F) -> Self
    where
        F: FnOnce(&mut IngressContext, IngressRequest) -> BoxFuture<'static, Response> + Send + 'a,
    {
        Self {
            inner: NextInner::Endpoint(Box::new(endpoint)),
        }
    }

    /// Runs the next stage, or the endpoint at the end of the chain.
    pub async fn run(self, ctx: &mut IngressContext, request: IngressRequest) -> Response {
        match self.inner {
            NextInner::Chain { middleware, next } => middleware.process(ctx, request, *next).await,
            NextInner::Endpoint(endpoint) => endpoint(ctx, request).await,
        }
    }
}

/// An ordered, immutable list of stages.
///
/// The ingress rebuilds its pipeline when its config changes and swaps it in
/// atomically.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Creates an empty pipeline builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Runs a request through the stages and then `endpoint`.
    pub async fn process<F>(&self, mut ctx: IngressContext, request: IngressRequest, endpoint: F) -> Response
    where
        F: FnOnce(&mut IngressContext, IngressRequest) -> BoxFuture<'static, Response> + Send + 'static,
    {
        let mut next = Next::endpoint(endpoint);
        for stage in self.stages.iter().rev() {
            next = Next::new(stage.as_ref(), next);
        }
        next.run(&mut ctx, request).await
    }

    /// Names of the stages, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Builder of a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Appends a stage. Stages run in the order they are added.
    #[must_use]
    pub fn stage<M: Middleware>(mut self, middleware: M) -> Self {
        self.stages.push(Arc::new(middleware));
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http::StatusCode;
    use microbus_core::ResponseExt;
    use parking_lot::Mutex;

    pub(crate) fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> IngressRequest {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(full_body(Bytes::new())).unwrap()
    }

    pub(crate) fn context() -> IngressContext {
        IngressContext::new(8080, Some(([10, 0, 0, 7], 5555).into()), false)
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn process<'a>(
            &'a self,
            ctx: &'a mut IngressContext,
            request: IngressRequest,
            next: Next<'a>,
        ) -> BoxFuture<'a, Response> {
            Box::pin(async move {
                self.log.lock().push(format!("before {}", self.name));
                let response = next.run(ctx, request).await;
                self.log.lock().push(format!("after {}", self.name));
                response
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn name(&self) -> &'static str {
            "deny"
        }

        fn process<'a>(
            &'a self,
            _ctx: &'a mut IngressContext,
            _request: IngressRequest,
            _next: Next<'a>,
        ) -> BoxFuture<'a, Response> {
            Box::pin(async { Response::empty(StatusCode::FORBIDDEN) })
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .stage(Recorder { name: "first", log: Arc::clone(&log) })
            .stage(Recorder { name: "second", log: Arc::clone(&log) })
            .build();
        assert_eq!(pipeline.stage_names(), vec!["first", "second"]);

        let endpoint_log = Arc::clone(&log);
        let response = pipeline
            .process(context(), request("GET", "/x", &[]), move |_ctx, _req| {
                endpoint_log.lock().push("endpoint".to_string());
                Box::pin(async { Response::text("ok") })
            })
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock(),
            vec!["before first", "before second", "endpoint", "after second", "after first"]
        );
    }

    #[tokio::test]
    async fn test_stage_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .stage(Deny)
            .stage(Recorder { name: "unreached", log: Arc::clone(&log) })
            .build();
        let response = pipeline
            .process(context(), request("GET", "/x", &[]), |_ctx, _req| {
                Box::pin(async { Response::text("ok") })
            })
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_context_scheme() {
        assert_eq!(context().scheme(), "http");
        assert_eq!(IngressContext::new(443, None, true).scheme(), "https");
    }
}
