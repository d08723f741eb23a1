// ABOUTME: Bounded key-value store whose entries expire after a fixed time-to-live.
// ABOUTME: Owned and injected by callers; eviction is LRU by capacity plus expiry on read.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// A thread-safe LRU cache with a per-entry TTL.
///
/// Capacity bounds memory; entries older than the TTL are treated as absent and dropped
/// on the next access.
pub struct TtlCache<K: Hash + Eq, V> {
    ttl: Duration,
    entries: Mutex<LruCache<K, (Instant, V)>>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Live value for `key`, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key).map(|(_, v)| v)
    }

    /// Number of stored entries, including any not yet purged after expiry.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self)
    where
        K: Clone,
    {
        let now = Instant::now();
        let mut entries = self.lock();
        let stale: Vec<K> = entries
            .iter()
            .filter(|(_, (at, _))| now.duration_since(*at) >= self.ttl)
            .map(|(k, _)| k)
            .cloned()
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.lock();
        let expired = match entries.get(key) {
            Some((at, value)) if now.duration_since(*at) < self.ttl => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn insert_at(&self, key: K, value: V, now: Instant) {
        self.lock().put(key, (now, value));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, (Instant, V)>> {
        // A poisoned lock only means another thread panicked mid-update; the map is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache(capacity: usize, ttl_secs: u64) -> TtlCache<String, u32> {
        TtlCache::new(NonZeroUsize::new(capacity).unwrap(), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn test_get_returns_live_entries() {
        let c = cache(4, 60);
        c.insert("a".into(), 1);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"b".to_string()), None);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let c = cache(4, 10);
        let start = Instant::now();
        c.insert_at("a".into(), 1, start);

        assert_eq!(c.get_at(&"a".to_string(), start + Duration::from_secs(9)), Some(1));
        assert_eq!(c.get_at(&"a".to_string(), start + Duration::from_secs(10)), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let c = cache(2, 60);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(c.get(&"a".to_string()), Some(1));
        c.insert("c".into(), 3);

        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"b".to_string()), None);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn test_reinsert_refreshes_timestamp() {
        let c = cache(4, 10);
        let start = Instant::now();
        c.insert_at("a".into(), 1, start);
        c.insert_at("a".into(), 2, start + Duration::from_secs(8));

        assert_eq!(c.get_at(&"a".to_string(), start + Duration::from_secs(15)), Some(2));
    }

    #[test]
    fn test_remove_and_purge() {
        let c = cache(4, 0);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        assert_eq!(c.remove(&"a".to_string()), Some(1));
        c.purge_expired();
        assert!(c.is_empty());
        assert_eq!(c.capacity(), 4);
    }
}
