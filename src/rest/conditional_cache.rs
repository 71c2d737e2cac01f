//! Conditional-request cache
//!
//! Stores the last validator token (ETag) and response body per
//! `(method, absolute-url)` pair so unchanged resources cost a 304 instead
//! of a full body. Bounded by an LRU policy; reads take the shared lock,
//! writes the exclusive one.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    method: String,
    url: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    etag: String,
    body: Vec<u8>,
}

/// Bounded `(method, url)` -> `{etag, body}` cache.
pub struct ConditionalCache {
    inner: RwLock<LruCache<CacheKey, CacheEntry>>,
}

impl ConditionalCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Validator token for a request, if one is cached.
    ///
    /// Uses `peek` so the read path never reorders the LRU list and can run
    /// under the shared lock.
    pub fn validator(&self, method: &str, url: &str) -> Option<String> {
        let key = CacheKey {
            method: method.to_string(),
            url: url.to_string(),
        };
        self.inner.read().peek(&key).map(|e| e.etag.clone())
    }

    /// Cached response body for a request.
    pub fn body(&self, method: &str, url: &str) -> Option<Vec<u8>> {
        let key = CacheKey {
            method: method.to_string(),
            url: url.to_string(),
        };
        self.inner.read().peek(&key).map(|e| e.body.clone())
    }

    /// Stores a new validator and body, promoting the entry.
    pub fn store(&self, method: &str, url: &str, etag: String, body: Vec<u8>) {
        let key = CacheKey {
            method: method.to_string(),
            url: url.to_string(),
        };
        debug!(method, url, etag = %etag, "Caching conditional-request entry");
        self.inner.write().put(key, CacheEntry { etag, body });
        metrics::record_conditional_cache("store");
    }

    /// Drops the entry for a request, if present.
    pub fn invalidate(&self, method: &str, url: &str) {
        let key = CacheKey {
            method: method.to_string(),
            url: url.to_string(),
        };
        if self.inner.write().pop(&key).is_some() {
            metrics::record_conditional_cache("invalidate");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_lookup() {
        let cache = ConditionalCache::new(8);
        cache.store("GET", "https://api.test/repos/a", "\"abc\"".into(), b"body".to_vec());

        assert_eq!(
            cache.validator("GET", "https://api.test/repos/a").as_deref(),
            Some("\"abc\"")
        );
        assert_eq!(
            cache.body("GET", "https://api.test/repos/a").as_deref(),
            Some(b"body".as_slice())
        );
    }

    #[test]
    fn test_method_is_part_of_the_key() {
        let cache = ConditionalCache::new(8);
        cache.store("GET", "https://api.test/x", "\"g\"".into(), vec![1]);

        assert!(cache.validator("HEAD", "https://api.test/x").is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ConditionalCache::new(8);
        cache.store("GET", "https://api.test/x", "\"g\"".into(), vec![1]);
        cache.invalidate("GET", "https://api.test/x");

        assert!(cache.validator("GET", "https://api.test/x").is_none());
    }

    #[test]
    fn test_lru_bound_evicts_oldest() {
        let cache = ConditionalCache::new(2);
        cache.store("GET", "https://api.test/1", "\"1\"".into(), vec![]);
        cache.store("GET", "https://api.test/2", "\"2\"".into(), vec![]);
        cache.store("GET", "https://api.test/3", "\"3\"".into(), vec![]);

        assert_eq!(cache.len(), 2);
        assert!(cache.validator("GET", "https://api.test/1").is_none());
        assert!(cache.validator("GET", "https://api.test/3").is_some());
    }
}
