//! LRU query cache with per-entry TTL (C11), adapted from the teacher's
//! `lru::LruCache`-backed query-embedding cache, generalized with an
//! expiry the teacher's cache never needed.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// An LRU cache where entries also expire after `ttl`, used to cache
/// finished retrieval responses keyed by `(company_identifier, request
/// fingerprint)` per spec §4.8 step 12 (5 minute default TTL).
pub struct TtlLruCache<K, V>
where
    K: std::hash::Hash + Eq,
{
    inner: LruCache<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlLruCache<K, V>
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity > 0");
        Self {
            inner: LruCache::new(capacity),
            ttl,
        }
    }

    /// Returns a fresh value for `key`, evicting it first if it has expired.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self
            .inner
            .peek(key)
            .map(|entry| entry.inserted_at.elapsed() >= self.ttl)
            .unwrap_or(false);

        if expired {
            self.inner.pop(key);
            return None;
        }

        self.inner.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_value_before_ttl_expires() {
        let mut cache: TtlLruCache<String, i32> = TtlLruCache::new(4, Duration::from_secs(60));
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
    }

    #[test]
    fn evicts_after_ttl() {
        let mut cache: TtlLruCache<String, i32> = TtlLruCache::new(4, Duration::from_millis(1));
        cache.put("a".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".into()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let mut cache: TtlLruCache<String, i32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        cache.put("c".into(), 3);
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.get(&"b".into()), Some(2));
        assert_eq!(cache.get(&"c".into()), Some(3));
    }
}
