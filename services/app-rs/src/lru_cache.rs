//! Bounded, TTL-aware in-process cache (L1).
//!
//! A plain `lru::LruCache` behind a mutex; every operation is a short
//! critical section, so contention stays negligible next to the network
//! layers below it. Stale entries are dropped lazily on read.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

pub struct MemoryCache<V> {
    inner: Mutex<LruCache<String, Slot<V>>>,
    default_ttl: Duration,
    max_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration, max_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            default_ttl: default_ttl.min(max_ttl),
            max_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value.clone())
            }
            Some(_) => {
                guard.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL, clamped to the cache-wide maximum.
    pub fn put_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let ttl = ttl.min(self.max_ttl);
        let slot = Slot {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().unwrap().put(key.to_string(), slot);
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache<String> {
        MemoryCache::new(2, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn stores_and_counts_hits() {
        let c = cache();
        c.put("a", "one".into());
        assert_eq!(c.get("a"), Some("one".into()));
        assert_eq!(c.get("b"), None);
        assert_eq!(c.hits(), 1);
        assert_eq!(c.misses(), 1);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let c = cache();
        c.put("a", "one".into());
        c.put("b", "two".into());
        c.get("a");
        c.put("c", "three".into());
        assert_eq!(c.get("a"), Some("one".into()));
        assert_eq!(c.get("b"), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn entries_expire_by_ttl() {
        let c = cache();
        c.put_with_ttl("a", "one".into(), Duration::from_millis(10));
        assert_eq!(c.get("a"), Some("one".into()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.get("a"), None);
    }

    #[test]
    fn ttl_is_clamped_to_maximum() {
        let c = MemoryCache::new(4, Duration::from_secs(1), Duration::from_millis(10));
        c.put_with_ttl("a", "one".to_string(), Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.get("a"), None);
    }

    #[test]
    fn remove_is_immediate() {
        let c = cache();
        c.put("a", "one".into());
        c.remove("a");
        assert_eq!(c.get("a"), None);
    }
}
