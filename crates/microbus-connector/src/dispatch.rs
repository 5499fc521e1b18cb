//! Incoming requests.
//!
//! Every subscription listens on two subjects: the service subject shared by
//! all instances of the host, and the instance subject `{id}.{host}` used to
//! address this instance directly. Several subscriptions of a connector may
//! receive the same message; only the one whose route wins path matching
//! handles it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::FutureExt;
use http::StatusCode;
use microbus_core::frame::strip_control_headers;
use microbus_core::{
    Context, FrameMut, MicrobusError, MicrobusResult, OpCode, PathArgs, Request, RequestExt,
    Response, ResponseExt, SharedHandler, CONTROL_PORT, DEFAULT_PORT,
};
use microbus_telemetry::metrics::{record_server_request, InFlightGuard};
use microbus_telemetry::tracing::{end_span, extract_context, force_trace_hex, start_span, trace_id};
use microbus_transport::codec::{self, Message};
use microbus_transport::fragment::{fragment, DEFAULT_FRAGMENT_SIZE};
use microbus_transport::subject::{reply_subject, request_subject};
use microbus_transport::Delivery;
use opentelemetry::trace::SpanKind;
use opentelemetry::KeyValue;
use tracing::{debug, error, warn};

use crate::subscription::Endpoint;
use crate::Connector;

impl Connector {
    /// Subscribes an endpoint to its service and instance subjects and
    /// spawns a reader for each.
    pub(crate) async fn bind(&self, endpoint: &Arc<Endpoint>) -> MicrobusResult<()> {
        let transport = self.transport()?;
        let plane = self.plane();
        let route = &endpoint.route;
        let service_subject = request_subject(&plane, &route.host, route.port, &endpoint.method);
        let instance_subject = request_subject(
            &plane,
            &format!("{}.{}", self.id(), route.host),
            route.port,
            &endpoint.method,
        );

        let service_sub = transport
            .subscribe(&service_subject, endpoint.queue.as_deref())
            .await?;
        let instance_sub = transport.subscribe(&instance_subject, None).await?;

        let mut handles = Vec::with_capacity(2);
        for mut sub in [service_sub, instance_sub] {
            let weak = self.downgrade();
            let endpoint = Arc::clone(endpoint);
            handles.push(tokio::spawn(async move {
                while let Some(delivery) = sub.next().await {
                    let Some(con) = weak.upgrade() else {
                        break;
                    };
                    let endpoint = Arc::clone(&endpoint);
                    tokio::spawn(async move {
                        con.handle_delivery(&endpoint, delivery).await;
                    });
                }
            }));
        }

        // Unsubscribed while binding
        if !self.inner.endpoints.read().contains_key(&endpoint.key) {
            for handle in handles {
                handle.abort();
            }
            return Ok(());
        }
        if let Some(previous) = self
            .inner
            .readers
            .lock()
            .insert(endpoint.key.clone(), handles)
        {
            for handle in previous {
                handle.abort();
            }
        }
        debug!(host = %self.hostname(), subject = %service_subject, queue = ?endpoint.queue, "Bound subscription");
        Ok(())
    }

    /// Stops the readers of an endpoint, unsubscribing it from the bus.
    pub(crate) fn unbind(&self, key: &str) {
        if let Some(handles) = self.inner.readers.lock().remove(key) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub(crate) async fn bind_all(&self) -> MicrobusResult<()> {
        let endpoints: Vec<Arc<Endpoint>> =
            self.inner.endpoints.read().values().cloned().collect();
        for endpoint in &endpoints {
            self.bind(endpoint).await?;
        }
        Ok(())
    }

    pub(crate) fn unbind_all(&self) {
        let readers: Vec<_> = self.inner.readers.lock().drain().collect();
        for (_, handles) in readers {
            for handle in handles {
                handle.abort();
            }
        }
    }

    async fn handle_delivery(&self, endpoint: &Endpoint, delivery: Delivery) {
        let msg = match codec::decode(delivery.payload) {
            Ok(Message::Request(req)) => req,
            Ok(Message::Response(_)) => return,
            Err(e) => {
                debug!(host = %self.hostname(), subject = %delivery.subject, error = %e, "Dropping undecodable message");
                return;
            }
        };

        // Only the winning subscription handles the message
        let host = msg.uri().host().unwrap_or_default();
        let host = host
            .strip_prefix(self.id())
            .and_then(|h| h.strip_prefix('.'))
            .unwrap_or(host)
            .to_string();
        let port = msg.uri().port_u16().unwrap_or(DEFAULT_PORT);
        let Some((winner, params)) = self.inner.routes.read().lookup(
            &host,
            port,
            msg.method().as_str(),
            msg.uri().path(),
        ) else {
            return;
        };
        if winner != endpoint.key {
            return;
        }

        let frame = msg.frame();
        let msg_id = frame.msg_id().to_string();
        let from_id = frame.from_id().to_string();
        if frame.fragment().0 == 1 {
            let mut ack = Response::empty(StatusCode::ACCEPTED);
            self.stamp_reply(&mut ack, &msg_id, endpoint, OpCode::Ack);
            self.send_reply(&msg_id, ack).await;
        }

        let req = match self
            .inner
            .defrag
            .integrate(&format!("{from_id}|{msg_id}"), msg)
        {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                let err = MicrobusError::from(microbus_transport::TransportError::from(e));
                let res = self.error_response(&err, &msg_id, endpoint);
                self.send_reply(&msg_id, res).await;
                return;
            }
        };

        self.process(endpoint, req, params, &host, port, &msg_id).await;
    }

    async fn process(
        &self,
        endpoint: &Endpoint,
        mut req: Request,
        params: microbus_router::Params,
        host: &str,
        port: u16,
        msg_id: &str,
    ) {
        let started = Instant::now();
        let _token = self.inner.in_flight.acquire();
        let _guard = InFlightGuard::new();

        let budget = req.frame().time_budget().unwrap_or_else(|| self.time_budget());
        let parent = extract_context(req.headers());
        let span_cx = start_span(
            &parent,
            format!("{host}:{port}{}", endpoint.route.path),
            SpanKind::Server,
            vec![
                KeyValue::new("http.method", req.method().to_string()),
                KeyValue::new("url.path", req.uri().path().to_string()),
                KeyValue::new("microbus.from.host", req.frame().from_host().to_string()),
            ],
        );
        let ctx = Context::background()
            .with_timeout(budget)
            .with_cancel(self.lifetime_signal())
            .with_frame(req.headers().clone())
            .with_otel(span_cx.clone());
        req.extensions_mut().insert(PathArgs(params));

        let result = if budget.is_zero() {
            Err(MicrobusError::timeout("time budget exhausted"))
        } else {
            invoke(&endpoint.handler, ctx.clone(), req).await
        };

        let res = match result {
            Ok(mut res) => {
                strip_control_headers(res.headers_mut());
                self.stamp_reply(&mut res, msg_id, endpoint, OpCode::Response);
                end_span(&span_cx, None);
                res
            }
            Err(err) => {
                let err = err.trace();
                if err.status_code().is_server_error() {
                    error!(host = %self.hostname(), endpoint = %endpoint.key, msg_id = %msg_id, error = %err, "Handler failed");
                    if let Some(trace) = trace_id(&span_cx) {
                        self.spread_trace(&ctx, endpoint, trace);
                    }
                } else {
                    debug!(host = %self.hostname(), endpoint = %endpoint.key, msg_id = %msg_id, error = %err, "Handler rejected request");
                }
                end_span(&span_cx, Some(err.message()));
                self.error_response(&err, msg_id, endpoint)
            }
        };

        record_server_request(
            host,
            port,
            &endpoint.method,
            &endpoint.route.path,
            res.status().as_u16(),
            started.elapsed(),
        );
        self.send_reply(msg_id, res).await;
    }

    /// Forces the export of a failed trace here and in every peer.
    fn spread_trace(&self, ctx: &Context, endpoint: &Endpoint, trace: String) {
        force_trace_hex(&trace);
        if endpoint.route.port == CONTROL_PORT {
            return;
        }
        let con = self.clone();
        self.go(ctx, move |ctx| async move {
            let body = serde_json::json!({ "id": trace });
            let mut responses = con.publish(&ctx, crate::request::post_json_request("https://all:888/trace", &body)?);
            while responses.next().await.is_some() {}
            Ok(())
        });
    }

    fn error_response(&self, err: &MicrobusError, msg_id: &str, endpoint: &Endpoint) -> Response {
        let mut res = Response::with_body(
            err.status_code(),
            "application/json",
            err.to_json(self.deployment().is_debug()),
        );
        self.stamp_reply(&mut res, msg_id, endpoint, OpCode::Error);
        res
    }

    /// Fails a request whose fragments stopped arriving.
    pub(crate) async fn reply_incomplete(&self, key: &str) {
        let Some((_, msg_id)) = key.split_once('|') else {
            return;
        };
        let err = MicrobusError::timeout("timed out waiting for request fragments");
        let mut res = Response::with_body(
            err.status_code(),
            "application/json",
            err.to_json(self.deployment().is_debug()),
        );
        FrameMut::of(res.headers_mut())
            .set_op_code(OpCode::Error)
            .set_msg_id(msg_id)
            .set_from_host(self.hostname())
            .set_from_id(self.id())
            .set_from_version(self.version());
        self.send_reply(msg_id, res).await;
    }

    fn stamp_reply(&self, res: &mut Response, msg_id: &str, endpoint: &Endpoint, op: OpCode) {
        let mut frame = FrameMut::of(res.headers_mut());
        frame
            .set_op_code(op)
            .set_msg_id(msg_id)
            .set_from_host(self.hostname())
            .set_from_id(self.id())
            .set_from_version(self.version());
        if let Some(queue) = &endpoint.queue {
            frame.set_queue(queue);
        }
    }

    async fn send_reply(&self, msg_id: &str, res: Response) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let subject = reply_subject(&self.plane(), msg_id);
        for part in fragment(res, DEFAULT_FRAGMENT_SIZE) {
            let payload = match codec::encode_response(&part) {
                Ok(p) => p,
                Err(e) => {
                    error!(host = %self.hostname(), msg_id = %msg_id, error = %e, "Failed to encode reply");
                    return;
                }
            };
            if let Err(e) = self.publish_with_retry(&*transport, &subject, payload).await {
                warn!(host = %self.hostname(), msg_id = %msg_id, error = %e, "Failed to send reply");
                return;
            }
        }
    }

    /// Publishes a payload, retrying once on failure.
    pub(crate) async fn publish_with_retry(
        &self,
        transport: &dyn microbus_transport::Transport,
        subject: &str,
        payload: Bytes,
    ) -> MicrobusResult<()> {
        match transport.publish(subject, payload.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(host = %self.hostname(), subject = %subject, error = %e, "Retrying publish");
                transport.publish(subject, payload).await.map_err(Into::into)
            }
        }
    }
}

/// Calls a handler, converting panics into internal errors.
pub(crate) async fn invoke(handler: &SharedHandler, ctx: Context, req: Request) -> MicrobusResult<Response> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(ctx, req))) {
        Ok(fut) => fut,
        Err(panic) => return Err(panic_error(&panic)),
    };
    catch_panic(fut).await
}

/// Awaits a future, converting a panic into an internal error.
pub async fn catch_panic<T, F>(fut: F) -> MicrobusResult<T>
where
    F: std::future::Future<Output = MicrobusResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(&panic)),
    }
}

fn panic_error(panic: &Box<dyn Any + Send>) -> MicrobusError {
    let message = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    MicrobusError::internal(format!("panic: {message}"))
}
