//! # Microbus Transport
//!
//! The publish/subscribe layer beneath the connector.
//!
//! - [`Transport`] - Subject-based publish and subscribe, with queue groups
//! - [`MemoryBus`] - In-process transport, shared by default
//! - `NatsTransport` - NATS transport (feature `nats`)
//! - [`subject`] - Subject scheme of requests and replies
//! - [`codec`] - Binary encoding of requests and responses
//! - [`fragment`] - Splitting and reassembly of large messages

#![doc(html_root_url = "https://docs.rs/microbus-transport/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod codec;
mod error;
pub mod fragment;
mod memory;
#[cfg(feature = "nats")]
mod nats;
pub mod subject;
mod transport;

pub use error::{CodecError, FragmentError, TransportError, TransportResult};
pub use fragment::{Assembler, DefragMap, Fragmentable};
pub use memory::MemoryBus;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use transport::{Delivery, Subscription, Transport};

use std::sync::Arc;

/// Connects to the transport named by `url`.
///
/// An empty URL selects the shared in-process bus. Any other URL requires
/// the `nats` feature.
pub async fn connect(url: &str) -> TransportResult<Arc<dyn Transport>> {
    if url.is_empty() {
        return Ok(MemoryBus::shared());
    }
    #[cfg(feature = "nats")]
    {
        Ok(Arc::new(NatsTransport::connect(url).await?))
    }
    #[cfg(not(feature = "nats"))]
    {
        Err(TransportError::Connect {
            url: url.to_string(),
            reason: "built without the nats feature".to_string(),
        })
    }
}
