//! Process-wide TTL response cache.
//!
//! One `ResponseCache` instance is constructed at startup and shared (via
//! `Arc`) by every feed, keyed by request URL. This collapses concurrent
//! fetches of the same upstream URL from unrelated consumers into a single
//! network round trip per TTL window. Entries are never evicted on a timer;
//! an expired entry is simply ignored on read and replaced by the next
//! successful fetch.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Value,
    pub fetched_at: Instant,
}

#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached payload for `url` if it is younger than `max_age`.
    pub fn get(&self, url: &str, max_age: Duration) -> Option<Value> {
        let entries = self.entries.read();
        let entry = entries.get(url)?;
        let age = entry.fetched_at.elapsed();
        if age < max_age {
            debug!(url, age_ms = age.as_millis() as u64, "cache hit");
            Some(entry.payload.clone())
        } else {
            debug!(url, age_ms = age.as_millis() as u64, "cache entry expired");
            None
        }
    }

    /// Store a freshly fetched payload. Last successful write for a key wins.
    pub fn insert(&self, url: &str, payload: Value) {
        let mut entries = self.entries.write();
        entries.insert(
            url.to_string(),
            CacheEntry {
                payload,
                fetched_at: Instant::now(),
            },
        );
        debug!(url, entries = entries.len(), "cached response");
    }

    /// Administrative clear of specific URLs.
    pub fn clear_urls(&self, urls: &[&str]) {
        let mut entries = self.entries.write();
        for url in urls {
            entries.remove(*url);
        }
        debug!(cleared = urls.len(), "cleared cache entries");
    }

    /// Administrative clear of the whole store.
    pub fn clear_all(&self) {
        let mut entries = self.entries.write();
        let size = entries.len();
        entries.clear();
        debug!(cleared = size, "cleared entire cache");
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn entry_valid_until_max_age() {
        let cache = ResponseCache::new();
        cache.insert("https://example.com/rates", json!({"venta": 1200.0}));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache
            .get("https://example.com/rates", Duration::from_secs(300))
            .is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache
            .get("https://example.com/rates", Duration::from_secs(300))
            .is_none());
    }

    #[tokio::test]
    async fn newer_write_replaces_older() {
        let cache = ResponseCache::new();
        cache.insert("u", json!(1));
        cache.insert("u", json!(2));
        assert_eq!(cache.get("u", Duration::from_secs(60)), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn clear_urls_and_clear_all() {
        let cache = ResponseCache::new();
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.clear_urls(&["a"]);
        assert!(cache.get("a", Duration::from_secs(60)).is_none());
        assert!(cache.get("b", Duration::from_secs(60)).is_some());
        cache.clear_all();
        assert!(cache.is_empty());
    }
}
