//! Distributed cache.
//!
//! Each instance of a host holds a slice of the cache in a weighted LRU.
//! A key lives on the instance picked by rendezvous hashing over the
//! instance ids discovered by pinging the host. Entries are lost when the
//! set of instances changes.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use microbus_core::{Context, Frame, MicrobusError, MicrobusResult, Request, RequestExt, Response, ResponseExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::lru::Lru;
use crate::request::post_json_request;
use crate::Connector;

/// Default capacity of the local slice, in bytes.
pub const DEFAULT_CACHE_CAPACITY: usize = 32 * 1024 * 1024;

/// Default time-to-live of cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

const PEERS_TTL: Duration = Duration::from_secs(10);

pub(crate) struct CacheState {
    pub lru: Mutex<Lru<String, Bytes>>,
    peers: Mutex<Option<(Instant, Vec<String>)>>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            lru: Mutex::new(Lru::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)),
            peers: Mutex::new(None),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CacheKey {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CacheStore {
    pub key: String,
    pub value: String,
    pub weight: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CacheLoad {
    pub found: bool,
    #[serde(default)]
    pub value: String,
}

/// A view of the distributed cache of a connector's host.
///
/// # Example
///
/// ```no_run
/// # async fn run(con: microbus_connector::Connector) -> microbus_core::MicrobusResult<()> {
/// use bytes::Bytes;
/// use microbus_core::Context;
///
/// let cache = con.distrib_cache();
/// let ctx = Context::background();
/// cache.store(&ctx, "greeting", Bytes::from_static(b"hello"), 5).await?;
/// assert!(cache.load(&ctx, "greeting").await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DistribCache {
    con: Connector,
}

impl Connector {
    /// The distributed cache shared by the instances of this host.
    #[must_use]
    pub fn distrib_cache(&self) -> DistribCache {
        DistribCache { con: self.clone() }
    }
}

impl DistribCache {
    /// Loads a value, `None` on a miss.
    pub async fn load(&self, ctx: &Context, key: &str) -> MicrobusResult<Option<Bytes>> {
        let owner = self.owner(ctx, key).await;
        if owner == self.con.id() {
            return Ok(self.con.inner.cache.lru.lock().get(key).cloned());
        }
        let url = format!("https://{owner}.{}:888/dcache/load", self.con.hostname());
        let res = match self
            .con
            .request(ctx, post_json_request(&url, &CacheKey { key: key.to_string() })?)
            .await
        {
            Ok(res) => res,
            Err(e) => {
                debug!(host = %self.con.hostname(), owner = %owner, error = %e, "Cache owner unreachable");
                self.forget_peers();
                return Ok(None);
            }
        };
        let load: CacheLoad = serde_json::from_slice(res.body())?;
        if !load.found {
            return Ok(None);
        }
        let value = STANDARD
            .decode(load.value)
            .map_err(|e| MicrobusError::internal(format!("invalid cached value: {e}")))?;
        Ok(Some(Bytes::from(value)))
    }

    /// Stores a value with a weight counted against the owner's capacity.
    pub async fn store(&self, ctx: &Context, key: &str, value: Bytes, weight: usize) -> MicrobusResult<()> {
        let owner = self.owner(ctx, key).await;
        if owner == self.con.id() {
            self.con
                .inner
                .cache
                .lru
                .lock()
                .insert(key.to_string(), value, weight);
            return Ok(());
        }
        let url = format!("https://{owner}.{}:888/dcache/store", self.con.hostname());
        let body = CacheStore {
            key: key.to_string(),
            value: STANDARD.encode(&value),
            weight,
        };
        if let Err(e) = self.con.request(ctx, post_json_request(&url, &body)?).await {
            self.forget_peers();
            return Err(e.trace());
        }
        Ok(())
    }

    /// Deletes a value from every instance.
    pub async fn delete(&self, ctx: &Context, key: &str) -> MicrobusResult<()> {
        self.con.inner.cache.lru.lock().remove(key);
        let url = format!("https://{}:888/dcache/delete", self.con.hostname());
        let mut responses = self
            .con
            .publish(ctx, post_json_request(&url, &CacheKey { key: key.to_string() })?);
        while let Some(res) = responses.next().await {
            if let Err(e) = res {
                debug!(host = %self.con.hostname(), error = %e, "Cache delete incomplete");
            }
        }
        Ok(())
    }

    /// Clears the local slice.
    pub fn clear_local(&self) {
        self.con.inner.cache.lru.lock().clear();
    }

    async fn owner(&self, ctx: &Context, key: &str) -> String {
        let peers = self.peers(ctx).await;
        rendezvous_owner(&peers, key).unwrap_or_else(|| self.con.id().to_string())
    }

    async fn peers(&self, ctx: &Context) -> Vec<String> {
        if let Some((at, peers)) = self.con.inner.cache.peers.lock().as_ref() {
            if at.elapsed() < PEERS_TTL {
                return peers.clone();
            }
        }
        let mut peers = vec![self.con.id().to_string()];
        let url = format!("https://{}:888/ping", self.con.hostname());
        match post_json_request(&url, &serde_json::json!({})) {
            Ok(req) => {
                let mut responses = self.con.publish(ctx, req);
                while let Some(res) = responses.next().await {
                    if let Ok(res) = res {
                        let id = Frame::of(res.headers()).from_id().to_string();
                        if !id.is_empty() && !peers.contains(&id) {
                            peers.push(id);
                        }
                    }
                }
            }
            Err(e) => debug!(error = %e, "Failed to build ping"),
        }
        peers.sort();
        *self.con.inner.cache.peers.lock() = Some((Instant::now(), peers.clone()));
        peers
    }

    fn forget_peers(&self) {
        *self.con.inner.cache.peers.lock() = None;
    }
}

/// FNV-1a, stable across processes.
fn fnv1a(parts: &[&[u8]]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// The peer with the highest score for `key`.
pub(crate) fn rendezvous_owner(peers: &[String], key: &str) -> Option<String> {
    peers
        .iter()
        .max_by_key(|peer| fnv1a(&[peer.as_bytes(), b"|", key.as_bytes()]))
        .cloned()
}

impl Connector {
    pub(crate) fn cache_load_local(&self, req: &Request) -> MicrobusResult<Response> {
        let CacheKey { key } = req.json()?;
        let load = match self.inner.cache.lru.lock().get(&key) {
            Some(value) => CacheLoad {
                found: true,
                value: STANDARD.encode(value),
            },
            None => CacheLoad::default(),
        };
        Response::json(&load)
    }

    pub(crate) fn cache_store_local(&self, req: &Request) -> MicrobusResult<Response> {
        let store: CacheStore = req.json()?;
        let value = STANDARD
            .decode(store.value)
            .map_err(|e| MicrobusError::bad_input(format!("invalid value: {e}")))?;
        self.inner
            .cache
            .lru
            .lock()
            .insert(store.key, Bytes::from(value), store.weight);
        Response::json(&serde_json::json!({}))
    }

    pub(crate) fn cache_delete_local(&self, req: &Request) -> MicrobusResult<Response> {
        let CacheKey { key } = req.json()?;
        self.inner.cache.lru.lock().remove(&key);
        Response::json(&serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(&[b""]), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(&[b"a"]), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(&[b"fo", b"o"]), fnv1a(&[b"foo"]));
    }

    #[test]
    fn test_rendezvous_owner_empty() {
        assert!(rendezvous_owner(&[], "key").is_none());
    }

    proptest! {
        #[test]
        fn test_rendezvous_owner_is_stable_when_other_peer_leaves(
            key in "[a-z0-9]{1,16}",
            peers in proptest::collection::hash_set("[a-z0-9]{10}", 2..6),
        ) {
            let peers: Vec<String> = peers.into_iter().collect();
            let owner = rendezvous_owner(&peers, &key).unwrap();
            let remaining: Vec<String> = peers.iter().filter(|p| **p != owner).cloned().collect();
            let survivor = remaining[0].clone();
            let without_other: Vec<String> = peers
                .iter()
                .filter(|p| **p == owner || **p != survivor)
                .cloned()
                .collect();
            prop_assert_eq!(rendezvous_owner(&without_other, &key), Some(owner));
        }
    }
}
