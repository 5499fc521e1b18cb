//! Handler trait for request processing.
//!
//! A [`Handler`] receives the [`Context`] of the call and the request, and
//! produces a response or a [`MicrobusError`](crate::MicrobusError). Any
//! `async` closure or function with a matching signature is a handler.
//!
//! ```rust,ignore
//! use microbus_core::{Context, MicrobusResult, Request, Response, ResponseExt};
//!
//! async fn hello(_ctx: Context, _req: Request) -> MicrobusResult<Response> {
//!     Ok(Response::text("Hello"))
//! }
//!
//! connector.subscribe("GET", "/hello", hello)?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::MicrobusResult;
use crate::message::{Request, Response};

/// Boxed future type used by handlers and middleware.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request handler.
pub trait Handler: Send + Sync + 'static {
    /// Handles a request.
    fn call(&self, ctx: Context, request: Request) -> BoxFuture<'static, MicrobusResult<Response>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MicrobusResult<Response>> + Send + 'static,
{
    fn call(&self, ctx: Context, request: Request) -> BoxFuture<'static, MicrobusResult<Response>> {
        Box::pin((self)(ctx, request))
    }
}

/// A shared, type-erased handler.
pub type SharedHandler = Arc<dyn Handler>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseExt;

    #[tokio::test]
    async fn test_closure_is_handler() {
        let handler: SharedHandler =
            Arc::new(|_ctx: Context, _req: Request| async { Ok(Response::text("ok")) });
        let res = handler
            .call(Context::background(), Request::default())
            .await
            .unwrap();
        assert_eq!(res.body().as_ref(), b"ok");
    }
}
