//! Control subscriptions on port 888.
//!
//! Every connector answers `ping`, `config-refresh` and `trace` both on its
//! own host and on the `all` host, and serves its slice of the distributed
//! cache on its own host. Control subscriptions have no queue so that every
//! instance receives them.

use std::future::Future;

use microbus_core::{Context, MicrobusError, MicrobusResult, Request, RequestExt, Response, ResponseExt};
use microbus_telemetry::tracing::force_trace_hex;
use serde::Deserialize;
use tracing::{debug, error};

use crate::subscription::SubscriptionOptions;
use crate::{Connector, WeakConnector};

#[derive(Debug, Deserialize)]
struct TraceRequest {
    id: String,
}

/// Wraps a control operation into a handler that holds only a weak
/// reference to the connector.
fn control<F, Fut>(weak: WeakConnector, op: F) -> impl Fn(Context, Request) -> ControlFuture<Fut>
where
    F: Fn(Connector, Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MicrobusResult<Response>> + Send + 'static,
{
    move |ctx, req| match weak.upgrade() {
        Some(con) => ControlFuture::Run(op(con, ctx, req)),
        None => ControlFuture::Gone,
    }
}

/// Future of a control handler.
enum ControlFuture<Fut> {
    Run(Fut),
    Gone,
}

impl<Fut> ControlFuture<Fut>
where
    Fut: Future<Output = MicrobusResult<Response>>,
{
    async fn resolve(self) -> MicrobusResult<Response> {
        match self {
            Self::Run(fut) => fut.await,
            Self::Gone => Err(MicrobusError::internal("microservice is gone")),
        }
    }
}

impl Connector {
    pub(crate) fn subscribe_control(&self) {
        for host in ["", "//all"] {
            self.control_route(host, "/ping", |_con, _ctx, _req| async {
                Response::json(&serde_json::json!({ "pong": 0 }))
            });
            self.control_route(host, "/config-refresh", |con, ctx, _req| async move {
                con.refresh_config(&ctx).await?;
                Response::json(&serde_json::json!({}))
            });
            self.control_route(host, "/trace", |_con, _ctx, req| async move {
                let TraceRequest { id } = req.json()?;
                force_trace_hex(&id);
                Response::json(&serde_json::json!({}))
            });
        }
        self.control_route("", "/dcache/load", |con, _ctx, req| async move {
            con.cache_load_local(&req)
        });
        self.control_route("", "/dcache/store", |con, _ctx, req| async move {
            con.cache_store_local(&req)
        });
        self.control_route("", "/dcache/delete", |con, _ctx, req| async move {
            con.cache_delete_local(&req)
        });
    }

    fn control_route<F, Fut>(&self, host: &str, path: &str, op: F)
    where
        F: Fn(Connector, Context, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MicrobusResult<Response>> + Send + 'static,
    {
        let route = format!("{host}:888{path}");
        let handler = control(self.downgrade(), op);
        let result = self.subscribe_with(
            "POST",
            &route,
            SubscriptionOptions::new().no_queue(),
            move |ctx: Context, req: Request| handler(ctx, req).resolve(),
        );
        match result {
            Ok(()) => debug!(host = %self.hostname(), route = %route, "Control subscription"),
            Err(e) => error!(host = %self.hostname(), route = %route, error = %e, "Failed to subscribe control route"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_subscriptions() {
        let con = Connector::new("control.example");
        let subs = con.subscriptions();
        assert!(subs.contains(&"POST https://control.example:888/ping".to_string()));
        assert!(subs.contains(&"POST https://all:888/ping".to_string()));
        assert!(subs.contains(&"POST https://all:888/config-refresh".to_string()));
        assert!(subs.contains(&"POST https://control.example:888/dcache/store".to_string()));
        assert!(!subs.contains(&"POST https://all:888/dcache/store".to_string()));
    }

    #[tokio::test]
    async fn test_control_handler_after_drop() {
        let con = Connector::new("control.example");
        let handler = control(con.downgrade(), |_con, _ctx, _req| async {
            Ok(Response::text("ok"))
        });
        drop(con);
        let err = handler(Context::background(), Request::default())
            .resolve()
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
