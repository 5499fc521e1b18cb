//! Weighted LRU cache with a time-to-live.
//!
//! Each entry has a weight; inserting past the maximum total weight evicts
//! the least recently used entries. Entries older than the TTL are treated
//! as absent.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    weight: usize,
    tick: u64,
    inserted: Instant,
}

/// A weighted LRU cache.
///
/// Not synchronized; wrap it in a mutex to share it.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use microbus_connector::lru::Lru;
///
/// let mut cache = Lru::new(10, Duration::from_secs(60));
/// cache.insert("a", 1, 6);
/// cache.insert("b", 2, 6);
/// assert!(cache.get("a").is_none());
/// assert_eq!(cache.get("b"), Some(&2));
/// ```
#[derive(Debug)]
pub struct Lru<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    weight: usize,
    max_weight: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    /// Creates a cache holding up to `max_weight` whose entries expire after
    /// `ttl`.
    #[must_use]
    pub fn new(max_weight: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            weight: 0,
            max_weight,
            ttl,
        }
    }

    /// Looks up a value and marks it as recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let expired = self
            .entries
            .get(key)
            .map(|e| e.inserted.elapsed() >= self.ttl)?;
        if expired {
            self.remove(key);
            return None;
        }
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        if let Some(k) = self.order.remove(&entry.tick) {
            self.order.insert(tick, k);
        }
        entry.tick = tick;
        Some(&entry.value)
    }

    /// Inserts a value with the given weight, evicting as needed. A value
    /// heavier than the cache itself is not stored.
    pub fn insert(&mut self, key: K, value: V, weight: usize) {
        self.remove(&key);
        if weight > self.max_weight {
            return;
        }
        while self.weight + weight > self.max_weight {
            if !self.evict_oldest() {
                break;
            }
        }
        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.weight += weight;
        self.entries.insert(
            key,
            Entry {
                value,
                weight,
                tick,
                inserted: Instant::now(),
            },
        );
    }

    /// Removes a value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.weight -= entry.weight;
        Some(entry.value)
    }

    /// Removes all values.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.weight = 0;
    }

    /// Number of entries, including expired ones not yet observed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total weight of the entries.
    #[must_use]
    pub const fn weight(&self) -> usize {
        self.weight
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.weight -= entry.weight;
        }
        true
    }
}
