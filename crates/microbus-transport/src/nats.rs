//! NATS transport.
//!
//! Enabled with the `nats` cargo feature.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};
use crate::transport::{Delivery, Subscription, Transport};

/// A transport backed by a NATS connection.
#[derive(Debug, Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connects to a NATS server.
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        info!(url, "Connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::publish(subject, e))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> TransportResult<Subscription> {
        let mut subscriber = match queue.filter(|q| !q.is_empty()) {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::subscribe(subject, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = subject.to_string();
        let forward = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let delivery = Delivery {
                    subject: message.subject.to_string(),
                    payload: message.payload,
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            debug!(subject = %pattern, "NATS subscription ended");
        });

        Ok(Subscription::new(subject, rx, move || forward.abort()))
    }

    async fn close(&self) -> TransportResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::publish("", e))
    }
}
