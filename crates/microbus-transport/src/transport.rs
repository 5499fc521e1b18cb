//! The transport abstraction.
//!
//! A [`Transport`] publishes payloads to subjects and delivers payloads
//! published to matching subjects to its subscribers. A subscription with a
//! queue name is load-balanced: each message goes to one member of the
//! queue group. A subscription without one is broadcast.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportResult;

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published to.
    pub subject: String,
    /// Encoded message.
    pub payload: Bytes,
}

/// A subject-based publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Publishes a payload. Fire and forget: succeeds even when nobody is
    /// subscribed.
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;

    /// Subscribes to a subject pattern, optionally as a member of a queue
    /// group.
    async fn subscribe(&self, subject: &str, queue: Option<&str>)
        -> TransportResult<Subscription>;

    /// Flushes pending messages and releases the connection.
    async fn close(&self) -> TransportResult<()>;
}

/// A live subscription. Unsubscribes when dropped.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription fed by `rx`. `on_drop` runs once when the
    /// subscription is dropped.
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// The subject pattern.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receives the next message, `None` once the transport stops feeding
    /// the subscription.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
