//! Bounded cache of recently seen message fingerprints

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default number of fingerprints remembered
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct SeenInner {
    entries: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Recent-message cache keyed by fingerprint
///
/// Entries expire after `ttl`; when full, the oldest entry is evicted.
#[derive(Debug)]
pub struct SeenCache {
    inner: Mutex<SeenInner>,
    capacity: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record `fingerprint`, returning `true` if it was not already present
    pub fn insert(&self, fingerprint: &str) -> bool {
        self.insert_at(fingerprint, Instant::now())
    }

    fn insert_at(&self, fingerprint: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        Self::evict_expired(&mut inner, now, self.ttl);

        if inner.entries.contains_key(fingerprint) {
            return false;
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((oldest, seen_at)) => {
                    if inner.entries.get(&oldest) == Some(&seen_at) {
                        inner.entries.remove(&oldest);
                    }
                }
                None => break,
            }
        }

        inner.entries.insert(fingerprint.to_string(), now);
        inner.order.push_back((fingerprint.to_string(), now));
        true
    }

    /// Whether `fingerprint` is currently remembered
    pub fn contains(&self, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock();
        Self::evict_expired(&mut inner, Instant::now(), self.ttl);
        inner.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(inner: &mut SeenInner, now: Instant, ttl: Duration) {
        while let Some((_, seen_at)) = inner.order.front() {
            if now.duration_since(*seen_at) <= ttl {
                break;
            }
            if let Some((fingerprint, seen_at)) = inner.order.pop_front() {
                if inner.entries.get(&fingerprint) == Some(&seen_at) {
                    inner.entries.remove(&fingerprint);
                }
            }
        }
    }
}
