//! DNS response cache with TTL-based expiration and stale serving.
//!
//! Expired entries are kept (until evicted by capacity) so the resolver can
//! answer once from the stale copy while it refreshes in the background.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use lru::LruCache;
use parking_lot::Mutex;

use crate::dns::cache_ttl;

/// Default maximum number of cached questions.
pub const DEFAULT_CACHE_SIZE: usize = 4096;

const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap();

struct CacheEntry {
    response: Message,
    expires_at: Instant,
}

/// Cached copy of a response together with its absolute expiry.
pub struct CacheHit {
    pub response: Message,
    pub expires_at: Instant,
}

impl CacheHit {
    pub fn is_stale(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds left until expiry, zero once stale.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Question-keyed response cache.
pub struct DnsCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a response; expired entries are still returned.
    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let mut entries = self.entries.lock();
        entries.get(key).map(|entry| CacheHit {
            response: entry.response.clone(),
            expires_at: entry.expires_at,
        })
    }

    /// Store a response. Messages with no records in any section are skipped.
    ///
    /// Returns whether the response was cached.
    pub fn put(&self, key: &str, response: &Message) -> bool {
        let Some(ttl) = cache_ttl(response) else {
            return false;
        };

        self.put_with_expire(key, response.clone(), Instant::now() + ttl);
        true
    }

    pub fn put_with_expire(&self, key: &str, response: Message, expires_at: Instant) {
        self.entries.lock().put(
            key.to_string(),
            CacheEntry {
                response,
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{new_query, question_key, testing};
    use hickory_proto::rr::RecordType;

    fn response(ttl: u32) -> (String, Message) {
        let q = new_query("example.com", RecordType::A).unwrap();
        let key = question_key(&q.queries()[0]);
        (key, testing::answer(&q, &["1.2.3.4".parse().unwrap()], ttl))
    }

    #[test]
    fn hit_before_expiry() {
        let cache = DnsCache::default();
        let (key, resp) = response(300);

        assert!(cache.put(&key, &resp));
        let hit = cache.get(&key).unwrap();

        let now = Instant::now();
        assert!(!hit.is_stale(now));
        assert!(hit.remaining(now) <= Duration::from_secs(300));
        assert!(hit.remaining(now) > Duration::from_secs(290));
    }

    #[test]
    fn expired_entries_are_served_stale() {
        let cache = DnsCache::default();
        let (key, resp) = response(0);

        cache.put(&key, &resp);
        let hit = cache.get(&key).unwrap();

        assert!(hit.is_stale(Instant::now()));
        assert_eq!(hit.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn empty_response_is_not_cached() {
        let cache = DnsCache::default();
        let q = new_query("example.com", RecordType::A).unwrap();
        let empty = testing::answer(&q, &[], 300);

        assert!(!cache.put("k", &empty));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = DnsCache::new(2);
        let (_, resp) = response(300);

        cache.put("a", &resp);
        cache.put("b", &resp);
        cache.get("a");
        cache.put("c", &resp);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.len(), 2);
    }
}
