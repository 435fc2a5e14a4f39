//! Short-lived metadata cache.
//!
//! Keeps file descriptors (under `files:<id>`) and hash-to-session lookups
//! out of the metadata store's hot path. Entries are immutable; writers are
//! responsible for invalidation, so the cache only has to expire and evict.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Cache key for a file descriptor.
pub fn file_key(id: &str) -> String {
    format!("files:{}", id)
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    generation: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Access order (front = oldest); stale generations skipped on pop
    order: VecDeque<(String, u64)>,
    generation: u64,
}

/// TTL + capacity bounded key-value cache
pub struct TtlCache<V: Clone> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache. A zero `default_ttl` keeps entries until evicted.
    pub fn new(default_ttl: Duration, capacity: usize) -> Self {
        TtlCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
            default_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Get a value, refreshing its recency. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) => matches!(entry.expires_at, Some(at) if at <= Instant::now()),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.order.push_back((key.to_string(), generation));
        let entry = inner.entries.get_mut(key)?;
        entry.generation = generation;
        Some(entry.value.clone())
    }

    /// Insert with the cache's default TTL.
    pub fn set(&self, key: &str, value: V) {
        let ttl = if self.default_ttl.is_zero() {
            None
        } else {
            Some(self.default_ttl)
        };
        self.set_with_ttl(key, value, ttl);
    }

    /// Insert with an explicit TTL (`None` = keep until evicted).
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut inner = self.inner.lock();

        inner.generation += 1;
        let generation = inner.generation;
        inner.order.push_back((key.to_string(), generation));
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
                generation,
            },
        );

        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some((key, generation)) => {
                    // Only a current-generation order slot is live
                    if inner
                        .entries
                        .get(&key)
                        .map(|e| e.generation == generation)
                        .unwrap_or(false)
                    {
                        inner.entries.remove(&key);
                    }
                }
                None => break,
            }
        }

        if inner.order.len() > self.capacity.saturating_mul(8) {
            Self::compact(&mut inner);
        }
    }

    /// Rebuild the order queue from live entries, dropping stale slots.
    fn compact(inner: &mut Inner<V>) {
        let mut items: Vec<(String, u64)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.generation))
            .collect();
        items.sort_by_key(|(_, g)| *g);

        inner.order.clear();
        inner.order.extend(items);
    }

    /// Remove an entry.
    pub fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
