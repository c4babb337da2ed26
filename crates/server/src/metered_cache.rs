use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chartdata_runtime::cache::{CacheEntry, ResultCache};

use crate::{CACHE_HITS, CACHE_MISSES};

/// Counts hits and misses of the wrapped cache.
pub struct MeteredCache {
    inner: Arc<dyn ResultCache>,
}

impl MeteredCache {
    pub fn new(inner: Arc<dyn ResultCache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ResultCache for MeteredCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.inner.get(key).await;
        if entry.is_some() {
            CACHE_HITS.inc();
        } else {
            CACHE_MISSES.inc();
        }
        entry
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) {
        self.inner.set(key, payload, ttl).await
    }

    async fn delete(&self, key: &str) {
        self.inner.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartdata_runtime::MokaResultCache;

    #[tokio::test]
    async fn test_counts_hits_and_misses() {
        let cache = MeteredCache::new(Arc::new(MokaResultCache::new(1)));
        let (hits, misses) = (CACHE_HITS.get(), CACHE_MISSES.get());

        assert!(cache.get("k").await.is_none());
        cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
        assert!(cache.get("k").await.is_some());

        // Other tests share the counters, so only lower bounds hold.
        assert!(CACHE_HITS.get() > hits);
        assert!(CACHE_MISSES.get() > misses);
    }
}
