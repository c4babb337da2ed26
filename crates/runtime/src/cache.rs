//! Result cache.
//!
//! Entries are opaque byte payloads with their own TTL. A read past the TTL is
//! a miss even if the backing store has not evicted the entry yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Arc<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    stored_at: Instant,
}

impl CacheEntry {
    pub fn new(payload: Vec<u8>, ttl: Duration) -> Self {
        Self {
            payload: Arc::new(payload),
            created_at: Utc::now(),
            ttl,
            stored_at: Instant::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Key/value store for serialized query contexts and query results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store `payload` under `key`. A zero TTL means the value is not cached.
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration);

    async fn delete(&self, key: &str);
}

struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache bounded by total payload size.
#[derive(Clone)]
pub struct MokaResultCache {
    cache: Cache<String, CacheEntry>,
}

impl MokaResultCache {
    pub fn new(max_size_mb: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_size_mb * 1024 * 1024)
            .weigher(|_key: &String, entry: &CacheEntry| -> u32 {
                entry.payload.len().try_into().unwrap_or(u32::MAX)
            })
            .expire_after(EntryExpiry)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl ResultCache for MokaResultCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.cache.get(key).await?;
        if entry.is_expired() {
            debug!(target: "cache", key = %key, "Dropping expired entry on read");
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        debug!(
            target: "cache",
            key = %key,
            size_bytes = payload.len(),
            ttl_secs = ttl.as_secs(),
            "Caching entry"
        );
        self.cache
            .insert(key.to_string(), CacheEntry::new(payload, ttl))
            .await;
    }

    async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}
