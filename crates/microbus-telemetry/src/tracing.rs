//! OpenTelemetry distributed tracing for Microbus.
//!
//! Spans are opened for every incoming and outgoing bus request and the
//! W3C trace context (`traceparent`, `tracestate`) travels in the headers of
//! the bus frames.
//!
//! Sampling is parent-based ratio sampling, except for trace ids registered
//! with [`force_trace`]. Those are always recorded, on every service that
//! learns of them, so an error observed mid-trace can pull the remainder of
//! the trace into the record.
//!
//! # Example
//!
//! ```rust,ignore
//! use microbus_telemetry::tracing::{TracingConfig, init_tracing, start_span};
//!
//! let provider = init_tracing(&TracingConfig::default())?;
//! let cx = start_span(&opentelemetry::Context::new(), "hello.example:443/echo", SpanKind::Server, vec![]);
//! ```

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::LazyLock;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, Status, TraceContextExt, TraceId, Tracer,
};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, ShouldSample, TracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;

use crate::TelemetryResult;

/// Name of the tracer used by the fabric.
pub const TRACER_NAME: &str = "microbus";

/// Cap on the number of remembered forced trace ids.
const MAX_FORCED: usize = 4096;

static FORCED: LazyLock<Mutex<HashSet<TraceId>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether tracing is enabled.
    pub enabled: bool,

    /// Service name for spans.
    pub service_name: String,

    /// Service version.
    pub service_version: String,

    /// Deployment environment (`LOCAL`, `TESTING`, `LAB`, `PROD`).
    pub environment: String,

    /// Sampling ratio of root spans (0.0 to 1.0).
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "microbus".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "LOCAL".to_string(),
            sample_ratio: 1.0,
        }
    }
}

/// Registers a trace id whose spans are always recorded from now on.
pub fn force_trace(trace_id: TraceId) {
    if trace_id == TraceId::INVALID {
        return;
    }
    let mut forced = FORCED.lock();
    if forced.len() >= MAX_FORCED {
        forced.clear();
    }
    forced.insert(trace_id);
}

/// Registers a trace id given in hex. Invalid input is ignored.
pub fn force_trace_hex(trace_id: &str) {
    if let Ok(id) = TraceId::from_hex(trace_id) {
        force_trace(id);
    }
}

/// Returns `true` if the trace id was registered with [`force_trace`].
#[must_use]
pub fn is_forced(trace_id: TraceId) -> bool {
    FORCED.lock().contains(&trace_id)
}

/// Sampler that records forced traces and otherwise defers to parent-based
/// ratio sampling.
#[derive(Debug, Clone)]
pub struct ForceTraceSampler {
    inner: Sampler,
}

impl ForceTraceSampler {
    /// Creates a sampler with the given root sampling ratio.
    #[must_use]
    pub fn new(ratio: f64) -> Self {
        let root = if ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(ratio)
        };
        Self {
            inner: Sampler::ParentBased(Box::new(root)),
        }
    }
}

impl ShouldSample for ForceTraceSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        if is_forced(trace_id) {
            let trace_state = parent_context
                .map(|cx| cx.span().span_context().trace_state().clone())
                .unwrap_or_default();
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: Vec::new(),
                trace_state,
            };
        }
        self.inner
            .should_sample(parent_context, trace_id, name, span_kind, attributes, links)
    }
}

/// Installs the global tracer provider and the W3C propagator.
///
/// No exporter is attached; spans are produced for context propagation and
/// for any processor added by the embedding program.
pub fn init_tracing(config: &TracingConfig) -> TelemetryResult<Option<TracerProvider>> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    if !config.enabled {
        return Ok(None);
    }

    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
            config.service_version.clone(),
        ),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let provider = TracerProvider::builder()
        .with_sampler(ForceTraceSampler::new(config.sample_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());

    Ok(Some(provider))
}

/// Opens a span as a child of `parent` and returns the context holding it.
pub fn start_span(
    parent: &Context,
    name: impl Into<Cow<'static, str>>,
    kind: SpanKind,
    attributes: Vec<KeyValue>,
) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(name)
        .with_kind(kind)
        .with_attributes(attributes)
        .start_with_context(&tracer, parent);
    parent.with_span(span)
}

/// Ends the span of `cx`, marking it failed when `error` is given.
pub fn end_span(cx: &Context, error: Option<&str>) {
    let span = cx.span();
    if let Some(error) = error {
        span.set_status(Status::error(error.to_string()));
    }
    span.end();
}

/// Hex trace id of the span of `cx`, if it carries a valid one.
#[must_use]
pub fn trace_id(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Extracts trace context from headers with the global propagator.
pub fn extract_context(headers: &http::HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Injects trace context into headers with the global propagator.
pub fn inject_context(context: &Context, headers: &mut http::HeaderMap) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(context, &mut HeaderInjector(headers));
    });
}

/// Propagation extractor over `http::HeaderMap`.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

/// Propagation injector over `http::HeaderMap`.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(val)) = (
            http::header::HeaderName::try_from(key),
            http::header::HeaderValue::try_from(&value),
        ) {
            self.0.insert(name, val);
        }
    }
}
