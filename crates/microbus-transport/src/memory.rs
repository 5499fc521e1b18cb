//! In-process bus.
//!
//! [`MemoryBus`] implements the subject and queue-group semantics of NATS
//! inside a single process. All connectors of a process share
//! [`MemoryBus::shared`] unless given another transport, which is how an
//! application runs without any external infrastructure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportResult;
use crate::subject::subject_matches;
use crate::transport::{Delivery, Subscription, Transport};

static SHARED: LazyLock<Arc<MemoryBus>> = LazyLock::new(|| Arc::new(MemoryBus::new()));

#[derive(Debug)]
struct Entry {
    id: u64,
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// An in-process transport.
#[derive(Debug, Default)]
pub struct MemoryBus {
    entries: Arc<RwLock<Vec<Entry>>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    /// Creates an isolated bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        let entries = self.entries.read();
        let mut groups: HashMap<&str, Vec<&Entry>> = HashMap::new();
        let mut delivered = 0_usize;
        for entry in entries.iter().filter(|e| subject_matches(&e.pattern, subject)) {
            match &entry.queue {
                Some(queue) => groups.entry(queue.as_str()).or_default().push(entry),
                None => {
                    let _ = entry.tx.send(Delivery {
                        subject: subject.to_string(),
                        payload: payload.clone(),
                    });
                    delivered += 1;
                }
            }
        }
        let mut rng = rand::rng();
        for members in groups.values() {
            let member = members[rng.random_range(0..members.len())];
            let _ = member.tx.send(Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
            });
            delivered += 1;
        }
        trace!(subject, delivered, "Published");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> TransportResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push(Entry {
            id,
            pattern: subject.to_string(),
            queue: queue.filter(|q| !q.is_empty()).map(str::to_string),
            tx,
        });

        let entries: Weak<RwLock<Vec<Entry>>> = Arc::downgrade(&self.entries);
        Ok(Subscription::new(subject, rx, move || {
            if let Some(entries) = entries.upgrade() {
                entries.write().retain(|e| e.id != id);
            }
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(sub: &mut Subscription) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(50), sub.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("p.x.443.GET", None).await.unwrap();
        let mut b = bus.subscribe("p.x.443.*", None).await.unwrap();
        bus.publish("p.x.443.GET", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(recv(&mut a).await.unwrap().payload.as_ref(), b"hi");
        assert_eq!(recv(&mut b).await.unwrap().subject, "p.x.443.GET");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("s", Some("q")).await.unwrap();
        let mut b = bus.subscribe("s", Some("q")).await.unwrap();
        for _ in 0..20 {
            bus.publish("s", Bytes::new()).await.unwrap();
        }
        let mut total = 0;
        while recv(&mut a).await.is_some() {
            total += 1;
        }
        while recv(&mut b).await.is_some() {
            total += 1;
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("s", None).await.unwrap();
        assert_eq!(bus.subscription_count(), 1);
        drop(sub);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_no_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish("nobody", Bytes::new()).await.is_ok());
    }
}
