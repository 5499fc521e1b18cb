//! Outgoing requests.
//!
//! A call publishes the first fragment of the request on the service subject
//! and listens on the reply subject derived from its message id. Responders
//! acknowledge before running the handler, so within the ack timeout the
//! caller learns how many responses to expect. Remaining request fragments
//! are sent to each acknowledging instance directly.

use std::collections::HashSet;
use std::time::Instant as StdInstant;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Uri};
use microbus_core::frame::strip_control_headers;
use microbus_core::ids::random_lower_id;
use microbus_core::{
    Context, Frame, FrameMut, MicrobusError, MicrobusResult, OpCode, Request, Response,
    DEFAULT_PORT,
};
use microbus_telemetry::metrics::{record_client_request, record_client_timeout};
use microbus_telemetry::tracing::{end_span, inject_context, start_span};
use microbus_transport::codec::{self, Message};
use microbus_transport::fragment::{
    fragment, DEFAULT_FRAGMENT_SIZE, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE,
};
use microbus_transport::subject::{reply_subject, request_subject};
use microbus_transport::DefragMap;
use opentelemetry::trace::SpanKind;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::{Connector, MAX_CALL_DEPTH};

/// The responses to a multicast request.
///
/// Responses arrive as they complete. The sequence ends when every
/// acknowledging responder has replied or the time budget runs out.
/// Dropping it cancels the call.
#[derive(Debug)]
pub struct Responses {
    rx: mpsc::UnboundedReceiver<MicrobusResult<Response>>,
    task: Option<JoinHandle<()>>,
}

impl Responses {
    fn failed(err: MicrobusError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Err(err));
        Self { rx, task: None }
    }

    /// The next response, or `None` when the call is over.
    pub async fn next(&mut self) -> Option<MicrobusResult<Response>> {
        self.rx.recv().await
    }

    /// Waits for all responses.
    pub async fn collect(mut self) -> Vec<MicrobusResult<Response>> {
        let mut all = Vec::new();
        while let Some(res) = self.next().await {
            all.push(res);
        }
        all
    }
}

impl Drop for Responses {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Builds a request with a JSON body.
pub fn post_json_request<T: Serialize + ?Sized>(url: &str, body: &T) -> MicrobusResult<Request> {
    let body = serde_json::to_vec(body)
        .map_err(|e| MicrobusError::bad_input(format!("failed to serialize request: {e}")))?;
    let mut req = build_request(Method::POST, url, Bytes::from(body))?;
    req.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(req)
}

fn build_request(method: Method, url: &str, body: Bytes) -> MicrobusResult<Request> {
    http::Request::builder()
        .method(method)
        .uri(url)
        .body(body)
        .map_err(|e| MicrobusError::bad_input(format!("invalid request to '{url}': {e}")))
}

struct Call {
    host: String,
    port: u16,
    method: String,
    multicast: bool,
    budget: std::time::Duration,
}

impl Connector {
    /// Sends a unicast request and waits for its response.
    ///
    /// Error responses are returned as errors carrying the responder's status
    /// code.
    pub async fn request(&self, ctx: &Context, req: Request) -> MicrobusResult<Response> {
        let mut responses = self.call(ctx, req, false);
        match responses.next().await {
            Some(result) => result.map_err(MicrobusError::trace),
            None => Err(MicrobusError::no_responders("no response")),
        }
    }

    /// Sends a multicast request to every instance subscribed to it.
    pub fn publish(&self, ctx: &Context, req: Request) -> Responses {
        self.call(ctx, req, true)
    }

    /// Sends a unicast `GET`.
    pub async fn get(&self, ctx: &Context, url: &str) -> MicrobusResult<Response> {
        self.request(ctx, build_request(Method::GET, url, Bytes::new())?)
            .await
    }

    /// Sends a unicast `POST` with a JSON body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        url: &str,
        body: &T,
    ) -> MicrobusResult<Response> {
        self.request(ctx, post_json_request(url, body)?).await
    }

    fn call(&self, ctx: &Context, req: Request, multicast: bool) -> Responses {
        let (req, call) = match self.prepare(ctx, req, multicast) {
            Ok(prepared) => prepared,
            Err(err) => return Responses::failed(err),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let con = self.clone();
        let ctx = ctx.clone();
        let task = tokio::spawn(async move {
            con.run_call(ctx, req, call, tx).await;
        });
        Responses {
            rx,
            task: Some(task),
        }
    }

    /// Normalizes the URL and stamps the control frame.
    fn prepare(&self, ctx: &Context, mut req: Request, multicast: bool) -> MicrobusResult<(Request, Call)> {
        if !matches!(
            self.state(),
            crate::State::Starting | crate::State::Started | crate::State::Stopping
        ) {
            return Err(MicrobusError::internal(format!(
                "{} is not started",
                self.hostname()
            )));
        }

        let uri = req.uri();
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MicrobusError::bad_input(format!("missing host in '{uri}'")))?
            .to_ascii_lowercase();
        let default_port = if uri.scheme_str() == Some("http") { 80 } else { DEFAULT_PORT };
        let port = uri.port_u16().unwrap_or(default_port);
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str()).to_string();
        let normalized: Uri = format!("https://{host}:{port}{path_and_query}")
            .parse()
            .map_err(|e| MicrobusError::bad_input(format!("invalid URL: {e}")))?;
        *req.uri_mut() = normalized;

        let parent = ctx.frame();
        let depth = parent.call_depth().saturating_add(1);
        if depth > MAX_CALL_DEPTH {
            return Err(MicrobusError::loop_detected(format!(
                "call depth exceeded calling {host}:{port}"
            )));
        }
        let budget = ctx
            .remaining()
            .map_or(self.time_budget(), |r| r.min(self.time_budget()));
        if budget.is_zero() {
            return Err(MicrobusError::timeout("time budget exhausted"));
        }

        let baggage: Vec<(String, String)> = parent
            .baggage_items()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let clock_shift = parent.clock_shift();

        strip_control_headers(req.headers_mut());
        let msg_id = random_lower_id(16);
        let mut frame = FrameMut::of(req.headers_mut());
        frame
            .set_op_code(OpCode::Request)
            .set_msg_id(&msg_id)
            .set_from_host(self.hostname())
            .set_from_id(self.id())
            .set_from_version(self.version())
            .set_call_depth(depth)
            .set_time_budget(budget);
        if clock_shift != 0 {
            frame.set_clock_shift(clock_shift);
        }
        for (name, value) in &baggage {
            frame.set_baggage(name, value);
        }

        let method = req.method().as_str().to_string();
        Ok((
            req,
            Call {
                host,
                port,
                method,
                multicast,
                budget,
            },
        ))
    }

    async fn run_call(
        &self,
        ctx: Context,
        mut req: Request,
        call: Call,
        tx: mpsc::UnboundedSender<MicrobusResult<Response>>,
    ) {
        let started = StdInstant::now();
        let span_cx = start_span(
            ctx.otel(),
            format!("{}:{}{}", call.host, call.port, req.uri().path()),
            SpanKind::Client,
            vec![
                KeyValue::new("http.method", call.method.clone()),
                KeyValue::new("server.address", call.host.clone()),
            ],
        );
        inject_context(&span_cx, req.headers_mut());

        let outcome = self.exchange(&ctx, req, &call, &tx).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => end_span(&span_cx, None),
            Err(err) => {
                if err.kind() == microbus_core::ErrorKind::Timeout {
                    record_client_timeout(&call.host, call.port, &call.method);
                }
                record_client_request(
                    &call.host,
                    call.port,
                    &call.method,
                    err.status_code().as_u16(),
                    elapsed,
                );
                end_span(&span_cx, Some(err.message()));
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Publishes the request and relays responses until the call is over.
    async fn exchange(
        &self,
        ctx: &Context,
        req: Request,
        call: &Call,
        tx: &mpsc::UnboundedSender<MicrobusResult<Response>>,
    ) -> MicrobusResult<()> {
        let started = StdInstant::now();
        let transport = self.transport()?;
        let plane = self.plane();
        let msg_id = Frame::of(req.headers()).msg_id().to_string();
        let mut replies = transport
            .subscribe(&reply_subject(&plane, &msg_id), None)
            .await?;

        let mut fragments = fragment(req, DEFAULT_FRAGMENT_SIZE).into_iter();
        let first = fragments
            .next()
            .ok_or_else(|| MicrobusError::internal("empty request"))?;
        let rest: Vec<Bytes> = fragments
            .map(|f| codec::encode_request(&f))
            .collect::<Result<_, _>>()
            .map_err(microbus_transport::TransportError::from)?;
        let service_subject = request_subject(&plane, &call.host, call.port, &call.method);
        self.publish_with_retry(
            &*transport,
            &service_subject,
            codec::encode_request(&first).map_err(microbus_transport::TransportError::from)?,
        )
        .await?;

        let ack_deadline = Instant::now() + self.ack_timeout();
        let deadline = Instant::now() + call.budget;
        let lifetime = self.lifetime_signal();
        let defrag: DefragMap<Response> = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut acked: HashSet<String> = HashSet::new();
        let mut done: HashSet<String> = HashSet::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(MicrobusError::timeout(format!(
                    "timeout calling {}:{}",
                    call.host, call.port
                )));
            }
            // A responder that stops sending fragments fails on its own
            for from_id in defrag.sweep(DEFAULT_INACTIVITY_TIMEOUT) {
                done.insert(from_id);
                let err = MicrobusError::timeout(format!(
                    "incomplete response calling {}:{}",
                    call.host, call.port
                ));
                if !call.multicast {
                    return Err(err);
                }
                if tx.send(Err(err)).is_err() {
                    return Ok(());
                }
            }
            let window_open = now < ack_deadline;
            if !window_open {
                if acked.is_empty() {
                    return Err(MicrobusError::no_responders(format!(
                        "no responders at {}:{}",
                        call.host, call.port
                    )));
                }
                if done.len() >= acked.len() {
                    return Ok(());
                }
            }
            let mut wake = if window_open {
                ack_deadline.min(deadline)
            } else {
                deadline
            };
            if let Some(expiry) = defrag.next_expiry(DEFAULT_INACTIVITY_TIMEOUT) {
                wake = wake.min(expiry);
            }

            tokio::select! {
                delivery = replies.next() => {
                    let Some(delivery) = delivery else {
                        return Err(MicrobusError::internal("reply subscription closed"));
                    };
                    let Ok(Message::Response(res)) = codec::decode(delivery.payload) else {
                        continue;
                    };
                    let from_id = Frame::of(res.headers()).from_id().to_string();
                    if done.contains(&from_id) {
                        continue;
                    }
                    if !acked.contains(&from_id) {
                        // Late responders are ignored once the window closes
                        if !window_open {
                            continue;
                        }
                        acked.insert(from_id.clone());
                        if !rest.is_empty() {
                            let instance_subject = request_subject(
                                &plane,
                                &format!("{from_id}.{}", call.host),
                                call.port,
                                &call.method,
                            );
                            for part in &rest {
                                self.publish_with_retry(&*transport, &instance_subject, part.clone()).await?;
                            }
                        }
                    }
                    if Frame::of(res.headers()).op_code() == OpCode::Ack {
                        continue;
                    }
                    let integrated = match defrag.integrate(&from_id, res) {
                        Ok(Some(res)) => res,
                        Ok(None) => continue,
                        Err(e) => {
                            done.insert(from_id);
                            let _ = tx.send(Err(microbus_transport::TransportError::from(e).into()));
                            continue;
                        }
                    };
                    done.insert(from_id);
                    let status = integrated.status().as_u16();
                    record_client_request(&call.host, call.port, &call.method, status, started.elapsed());
                    let item = if Frame::of(integrated.headers()).op_code() == OpCode::Error {
                        Err(MicrobusError::from_envelope(integrated.body()))
                    } else {
                        Ok(integrated)
                    };
                    if tx.send(item).is_err() || !call.multicast {
                        return Ok(());
                    }
                }
                () = sleep_until(wake) => {}
                () = ctx.done() => {
                    return Err(if ctx.is_cancelled() {
                        MicrobusError::internal("request cancelled")
                    } else {
                        MicrobusError::timeout(format!("timeout calling {}:{}", call.host, call.port))
                    });
                }
                () = lifetime.recv() => {
                    debug!(host = %self.hostname(), msg_id = %msg_id, "Cancelling call at shutdown");
                    return Err(MicrobusError::internal("connector shutting down"));
                }
                () = tx.closed() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_json_request() {
        let req = post_json_request("https://hello.example/echo", &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.body().as_ref(), br#"{"a":1}"#);
        assert!(build_request(Method::GET, "not a url", Bytes::new()).is_err());
    }

    #[tokio::test]
    async fn test_request_before_startup_fails() {
        let con = Connector::new("client.example");
        let err = con
            .get(&Context::background(), "https://hello.example/echo")
            .await
            .unwrap_err();
        assert!(err.message().contains("not started"));
    }

    #[tokio::test]
    async fn test_responses_failed_yields_error_once() {
        let mut responses = Responses::failed(MicrobusError::bad_input("nope"));
        assert!(responses.next().await.unwrap().is_err());
        assert!(responses.next().await.is_none());
    }
}
