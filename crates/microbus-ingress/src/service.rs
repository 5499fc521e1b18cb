//! The `http.ingress.sys` microservice.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use http_body_util::BodyExt;
use microbus_connector::{catch_panic, Changed, Connector, Service, WeakConnector};
use microbus_core::{BoxFuture, Context, Deployment, MicrobusError, MicrobusResult, Request, Response, ResponseExt};
use microbus_telemetry::metrics::record_ingress_response;
use microbus_telemetry::tracing::{end_span, start_span};
use opentelemetry::trace::SpanKind;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::memory::{MemoryLimiter, Reservation};
use crate::middleware::{IngressBody, IngressContext, IngressRequest, Pipeline};
use crate::server::{Handler, Listener};
use crate::settings::{self, Settings};
use crate::translate::{filter_request_headers, filter_response_headers, resolve, Target};

/// Host name of the ingress.
pub const INGRESS_HOSTNAME: &str = "http.ingress.sys";

/// Request header that shortens the time budget, in seconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "request-timeout";

/// Bytes read and discarded from a rejected body so the client sees the
/// response instead of a reset connection.
const MAX_DRAIN: usize = 16 * 1024 * 1024;

/// Internal host a response came from, for metrics.
#[derive(Debug, Clone)]
struct TargetHost(String);

/// Terminates external HTTP and forwards requests to microservices over
/// the bus.
///
/// ```rust,no_run
/// use microbus_ingress::Ingress;
///
/// # async fn run() -> microbus_core::MicrobusResult<()> {
/// let ingress = Ingress::new();
/// ingress.connector().set_config("Ports", "8080,443").await?;
/// ingress.connector().startup().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Ingress {
    con: Connector,
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: ArcSwapOption<Settings>,
    pipeline: ArcSwap<Pipeline>,
    memory: Arc<MemoryLimiter>,
    listeners: tokio::sync::Mutex<Vec<Listener>>,
    cert_dir: RwLock<PathBuf>,
    https_redirect: AtomicBool,
}

impl Default for Ingress {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for Ingress {
    fn connector(&self) -> &Connector {
        &self.con
    }
}

impl Ingress {
    /// Creates the ingress. Certificates are read from the working
    /// directory when listeners start.
    #[must_use]
    pub fn new() -> Self {
        let svc = Self {
            con: Connector::new(INGRESS_HOSTNAME),
            inner: Arc::new(Inner {
                settings: ArcSwapOption::empty(),
                pipeline: ArcSwap::from_pointee(Pipeline::default()),
                memory: MemoryLimiter::new(0),
                listeners: tokio::sync::Mutex::new(Vec::new()),
                cert_dir: RwLock::new(PathBuf::from(".")),
                https_redirect: AtomicBool::new(false),
            }),
        };
        svc.con.set_description(
            "The HTTP ingress forwards external HTTP requests to microservices on the bus.",
        );
        if let Err(e) = settings::define(&svc.con) {
            error!(error = %e, "Failed to define ingress config");
        }
        svc.register_hooks();
        svc
    }

    /// The connector of the ingress.
    #[must_use]
    pub fn connector(&self) -> &Connector {
        &self.con
    }

    /// Sets the directory `httpingress-{port}-cert.pem` and
    /// `httpingress-{port}-key.pem` are read from.
    pub fn set_cert_dir(&self, dir: &Path) {
        *self.inner.cert_dir.write() = dir.to_path_buf();
    }

    /// Bytes of request bodies currently held.
    #[must_use]
    pub fn request_memory_used(&self) -> usize {
        self.inner.memory.used()
    }

    /// The settings in effect, if started.
    #[must_use]
    pub fn settings(&self) -> Option<Arc<Settings>> {
        self.inner.settings.load_full()
    }

    fn register_hooks(&self) {
        let weak = self.downgrade();
        self.con.on_startup({
            let weak = weak.clone();
            move |_ctx: Context| {
                let svc = weak.upgrade();
                async move {
                    let svc = alive(svc)?;
                    svc.inner.settings.store(None);
                    let settings = Settings::load(&svc.con)?;
                    svc.apply(settings).await
                }
            }
        });
        self.con.on_shutdown({
            let weak = weak.clone();
            move |_ctx: Context| {
                let svc = weak.upgrade();
                async move {
                    let svc = alive(svc)?;
                    svc.stop_listeners().await;
                    svc.inner.settings.store(None);
                    Ok(())
                }
            }
        });
        self.con.on_config_changed(move |_ctx: Context, changed: Changed| {
            let svc = weak.upgrade();
            async move {
                let svc = alive(svc)?;
                if svc.inner.settings.load().is_none() {
                    return Ok(());
                }
                debug!(changed = ?changed.names().collect::<Vec<_>>(), "Reloading ingress config");
                let settings = Settings::load(&svc.con)?;
                svc.apply(settings).await
            }
        });
    }

    /// Swaps in new settings, restarting the listeners if they are affected.
    async fn apply(&self, settings: Settings) -> MicrobusResult<()> {
        self.inner.memory.set_limit(settings.memory_limit);
        self.con.set_time_budget(settings.time_budget);
        self.inner.pipeline.store(Arc::new(settings.pipeline()));
        let settings = Arc::new(settings);
        let previous = self.inner.settings.swap(Some(Arc::clone(&settings)));
        if previous.map_or(true, |p| p.listeners_differ(&settings)) {
            self.start_listeners(&settings).await?;
        }
        Ok(())
    }

    async fn start_listeners(&self, settings: &Settings) -> MicrobusResult<()> {
        let mut listeners = self.inner.listeners.lock().await;
        for listener in listeners.drain(..) {
            listener.stop().await;
        }
        let dir = self.inner.cert_dir.read().clone();
        let handler = self.handler();
        for &port in &settings.ports {
            match Listener::start(port, &dir, settings.read_header_timeout, Arc::clone(&handler)).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    for listener in listeners.drain(..) {
                        listener.stop().await;
                    }
                    return Err(e);
                }
            }
        }
        let redirect = listeners.iter().any(|l| l.port() == 443 && l.is_secure());
        self.inner.https_redirect.store(redirect, Ordering::SeqCst);
        info!(ports = ?settings.ports, https_redirect = redirect, "Ingress listeners started");
        Ok(())
    }

    async fn stop_listeners(&self) {
        let mut listeners = self.inner.listeners.lock().await;
        for listener in listeners.drain(..) {
            listener.stop().await;
        }
    }

    fn handler(&self) -> Handler {
        let weak = self.downgrade();
        Arc::new(move |ctx: IngressContext, req: IngressRequest| -> BoxFuture<'static, Response> {
            let svc = weak.upgrade();
            Box::pin(async move {
                match svc {
                    Some(svc) => svc.handle(ctx, req).await,
                    None => Response::empty(StatusCode::SERVICE_UNAVAILABLE),
                }
            })
        })
    }

    async fn handle(self, ctx: IngressContext, req: IngressRequest) -> Response {
        let started = Instant::now();
        let port = ctx.port();
        let method = req.method().to_string();

        let res = if port == 80 && !ctx.is_secure() && self.inner.https_redirect.load(Ordering::SeqCst) {
            redirect_to_https(&req)
        } else {
            let pipeline = self.inner.pipeline.load_full();
            let svc = self.clone();
            pipeline
                .process(ctx, req, move |ctx, req| {
                    let ctx = ctx.clone();
                    Box::pin(async move { svc.forward(ctx, req).await })
                })
                .await
        };

        let host = res.extensions().get::<TargetHost>().map_or("", |h| h.0.as_str());
        record_ingress_response(
            host,
            port,
            &method,
            res.status().as_u16(),
            started.elapsed(),
            res.body().len(),
        );
        res
    }

    async fn forward(&self, ctx: IngressContext, req: IngressRequest) -> Response {
        let Some(settings) = self.inner.settings.load_full() else {
            return Response::empty(StatusCode::SERVICE_UNAVAILABLE);
        };
        let target = match resolve(req.uri(), ctx.port(), &settings.port_mappings) {
            Ok(target) => target,
            Err(e) => return self.error_response(&e),
        };
        let host = target.host.clone();
        let mut res = match self.call(&settings, target, req).await {
            Ok(res) => res,
            Err(e) => self.error_response(&e),
        };
        res.extensions_mut().insert(TargetHost(host));
        res
    }

    async fn call(&self, settings: &Settings, target: Target, req: IngressRequest) -> MicrobusResult<Response> {
        let (mut parts, body) = req.into_parts();

        // Held until the bus call completes
        let mut reservation = self.inner.memory.reservation();
        let body = read_body(
            body,
            declared_length(&parts.headers),
            &mut reservation,
            settings.read_timeout,
        )
        .await?;

        let budget = request_timeout(&parts.headers)
            .map_or(settings.time_budget, |t| t.min(settings.time_budget));
        filter_request_headers(&mut parts.headers);
        let uri: Uri = target
            .url()
            .parse()
            .map_err(|e| MicrobusError::not_found(format!("invalid internal URL: {e}")))?;

        let mut bus_req = Request::new(body);
        *bus_req.method_mut() = parts.method;
        *bus_req.uri_mut() = uri;
        *bus_req.headers_mut() = parts.headers;

        // Client trace context is never trusted
        let span_cx = start_span(
            &opentelemetry::Context::new(),
            format!("{}:{}{}", target.host, target.port, bus_req.uri().path()),
            SpanKind::Server,
            vec![
                KeyValue::new("http.method", bus_req.method().to_string()),
                KeyValue::new("url.path", bus_req.uri().path().to_string()),
            ],
        );
        let ctx = self
            .con
            .lifetime()
            .with_timeout(budget)
            .with_otel(span_cx.clone());

        let result = catch_panic(self.con.request(&ctx, bus_req)).await;
        drop(reservation);
        match &result {
            Ok(_) => end_span(&span_cx, None),
            Err(e) => end_span(&span_cx, Some(e.message())),
        }
        let mut res = result?;
        filter_response_headers(res.headers_mut());
        Ok(res)
    }

    fn error_response(&self, err: &MicrobusError) -> Response {
        let status = err.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %err, "Ingress request failed");
        } else {
            debug!(status = status.as_u16(), error = %err, "Ingress request rejected");
        }
        let body = if self.con.deployment() == Deployment::Local {
            err.message().to_string()
        } else {
            status.canonical_reason().unwrap_or_default().to_string()
        };
        Response::with_body(status, "text/plain; charset=utf-8", body)
    }

    fn downgrade(&self) -> WeakIngress {
        WeakIngress {
            con: self.con.downgrade(),
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
struct WeakIngress {
    con: WeakConnector,
    inner: Weak<Inner>,
}

impl WeakIngress {
    fn upgrade(&self) -> Option<Ingress> {
        Some(Ingress {
            con: self.con.upgrade()?,
            inner: self.inner.upgrade()?,
        })
    }
}

fn alive(svc: Option<Ingress>) -> MicrobusResult<Ingress> {
    svc.ok_or_else(|| MicrobusError::internal("ingress is gone"))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn request_timeout(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers
        .get(REQUEST_TIMEOUT_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Reads a body into memory, reserving every byte against the limiter.
///
/// A declared `Content-Length` that does not fit is rejected before reading.
async fn read_body(
    mut body: IngressBody,
    declared: Option<usize>,
    reservation: &mut Reservation,
    timeout: Duration,
) -> MicrobusResult<Bytes> {
    let read = async {
        if let Some(len) = declared {
            if !reservation.grow(len) {
                drain(&mut body).await;
                return Err(MicrobusError::request_too_large("request body exceeds memory limit"));
            }
        }
        let mut buf = BytesMut::with_capacity(reservation.bytes());
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| MicrobusError::bad_input(format!("failed to read body: {e}")))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            let total = buf.len() + data.len();
            if total > reservation.bytes() && !reservation.grow(total - reservation.bytes()) {
                drain(&mut body).await;
                return Err(MicrobusError::request_too_large("request body exceeds memory limit"));
            }
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| MicrobusError::timeout("timed out reading request body"))?
}

async fn drain(body: &mut IngressBody) {
    let mut discarded = 0;
    while let Some(Ok(frame)) = body.frame().await {
        if let Some(data) = frame.data_ref() {
            discarded += data.len();
            if discarded > MAX_DRAIN {
                break;
            }
        }
    }
}

fn redirect_to_https(req: &IngressRequest) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("localhost");
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let mut res = Response::empty(StatusCode::MOVED_PERMANENTLY);
    if let Ok(location) = HeaderValue::from_str(&format!("https://{host}{path}")) {
        res.headers_mut().insert(LOCATION, location);
    }
    res
}
