//! Call context.
//!
//! A [`Context`] travels with every call. It carries the deadline by which the
//! call must complete, an optional cancellation signal, the control frame of
//! the incoming request that spawned it, and the OpenTelemetry context used to
//! parent spans and propagate trace headers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use tokio::time::Instant;

use crate::frame::Frame;
use crate::shutdown::ShutdownSignal;

/// Deadline, cancellation, frame and trace context of a call.
///
/// Contexts are cheap to clone. Derivation methods return a new context and
/// never loosen the deadline of their parent.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use microbus_core::Context;
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
/// assert!(ctx.remaining().unwrap() <= Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<ShutdownSignal>,
    frame: Option<Arc<HeaderMap>>,
    otel: opentelemetry::Context,
}

impl Context {
    /// An empty context with no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that expires after `timeout`, or earlier if the
    /// parent expires first.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context that expires at `deadline`, or earlier if the parent
    /// expires first.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        ctx
    }

    /// Derives a context cancelled by `signal`.
    #[must_use]
    pub fn with_cancel(&self, signal: ShutdownSignal) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = Some(signal);
        ctx
    }

    /// Derives a context carrying the control frame of a message.
    #[must_use]
    pub fn with_frame(&self, headers: HeaderMap) -> Self {
        let mut ctx = self.clone();
        ctx.frame = Some(Arc::new(headers));
        ctx
    }

    /// Derives a context with an OpenTelemetry context.
    #[must_use]
    pub fn with_otel(&self, otel: opentelemetry::Context) -> Self {
        let mut ctx = self.clone();
        ctx.otel = otel;
        ctx
    }

    /// Deadline of the context.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` if the deadline passed or the context was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Returns `true` if the cancellation signal was triggered.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(ShutdownSignal::is_shutdown)
    }

    /// Completes when the deadline passes or the context is cancelled.
    ///
    /// Never completes for a background context.
    pub async fn done(&self) {
        let cancelled = async {
            match &self.cancel {
                Some(signal) => signal.recv().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = cancelled => {}
            () = expired => {}
        }
    }

    /// The control frame of the incoming message, if any.
    #[must_use]
    pub fn frame(&self) -> Frame<'_> {
        Frame::of_opt(self.frame.as_deref())
    }

    /// Headers of the incoming message, if any.
    #[must_use]
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.frame.as_deref()
    }

    /// The OpenTelemetry context.
    #[must_use]
    pub const fn otel(&self) -> &opentelemetry::Context {
        &self.otel
    }

    /// Current time adjusted by the clock shift of the frame.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.frame().clock_shift())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMut;

    #[test]
    fn test_background_has_no_deadline() {
        let ctx = Context::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn test_child_never_loosens_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_done_on_cancel() {
        let signal = ShutdownSignal::new();
        let ctx = Context::background().with_cancel(signal.clone());
        signal.trigger();
        assert!(ctx.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), ctx.done())
            .await
            .expect("cancelled context is done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(3));
        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[test]
    fn test_frame_and_clock_shift() {
        let mut headers = HeaderMap::new();
        FrameMut::of(&mut headers)
            .set_msg_id("abc")
            .set_clock_shift(3_600_000);
        let ctx = Context::background().with_frame(headers);
        assert_eq!(ctx.frame().msg_id(), "abc");
        assert!(ctx.now() > Utc::now() + chrono::Duration::minutes(59));
    }
}
