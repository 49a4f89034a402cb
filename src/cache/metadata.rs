//! Metadata Cache Implementation
//!
//! Async Moka cache keyed by file identifier. A miss (or an expired entry)
//! runs exactly one upstream lookup per identifier no matter how many
//! requests are waiting on it; every waiter receives a copy of the result.
//! Expiry is checked lazily on access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{Result, StreamError};
use crate::store::{BackingStore, FileId, FileMetadata};

pub struct MetadataCache {
    store: Arc<dyn BackingStore>,
    entries: Cache<FileId, FileMetadata>,
    /// Deadline for a single upstream lookup
    lookup_timeout: Duration,
    /// Calls to `get`
    requests: AtomicU64,
    /// Upstream lookups actually issued
    lookups: AtomicU64,
}

impl MetadataCache {
    /// Create a cache in front of `store`
    ///
    /// # Arguments
    /// * `config` - TTL and optional entry bound
    /// * `lookup_timeout` - deadline for one upstream metadata call
    pub fn new(store: Arc<dyn BackingStore>, config: &CacheConfig, lookup_timeout: Duration) -> Self {
        let mut builder = Cache::builder()
            .time_to_live(config.ttl)
            .name("file_metadata_cache");
        if let Some(max) = config.max_entries {
            builder = builder.max_capacity(max);
        }

        Self {
            store,
            entries: builder.build(),
            lookup_timeout,
            requests: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Get metadata for `id`, consulting the backing store on a miss
    ///
    /// Failed lookups are not cached, so the next request retries upstream.
    /// Dropping the returned future while it waits on a shared lookup is safe:
    /// another waiter takes the lookup over.
    pub async fn get(&self, id: &FileId) -> Result<FileMetadata> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let store = Arc::clone(&self.store);
        let lookups = &self.lookups;
        let timeout = self.lookup_timeout;
        let key = id.clone();

        let result = self
            .entries
            .try_get_with(id.clone(), async move {
                lookups.fetch_add(1, Ordering::Relaxed);
                trace!(file_id = %key, "Cache MISS for file metadata");

                match tokio::time::timeout(timeout, store.fetch_metadata(&key)).await {
                    Ok(Ok(meta)) => {
                        debug!(
                            file_id = %key,
                            size = meta.size,
                            content_type = %meta.content_type,
                            "Cached file metadata"
                        );
                        Ok(meta)
                    }
                    Ok(Err(e)) => Err(StreamError::from(e)),
                    Err(_) => Err(StreamError::UpstreamTimeout(format!(
                        "metadata lookup for {} exceeded {:?}",
                        key, timeout
                    ))),
                }
            })
            .await;

        result.map_err(|e| (*e).clone())
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate). Requests that joined an in-flight
    /// lookup count as hits.
    pub fn stats(&self) -> (u64, u64, f64) {
        let requests = self.requests.load(Ordering::Relaxed);
        let misses = self.lookups.load(Ordering::Relaxed);
        let hits = requests.saturating_sub(misses);
        let hit_rate = if requests > 0 {
            (hits as f64 / requests as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            entries = self.entries.entry_count(),
            "Metadata cache metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache_over(store: Arc<MemoryStore>, ttl: Duration) -> MetadataCache {
        let config = CacheConfig {
            ttl,
            max_entries: Some(100),
        };
        MetadataCache::new(store, &config, Duration::from_secs(5))
    }

    fn seeded_store(delay: Duration) -> (Arc<MemoryStore>, FileId) {
        let store = MemoryStore::new().with_metadata_delay(delay);
        let id = FileId::parse("100_1").unwrap();
        store.insert(&id, vec![0u8; 1000], Some("video/mp4"), Some("clip.mp4"));
        (Arc::new(store), id)
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let (store, id) = seeded_store(Duration::ZERO);
        let cache = cache_over(Arc::clone(&store), Duration::from_secs(300));

        let first = cache.get(&id).await.unwrap();
        let second = cache.get(&id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.size, 1000);
        assert_eq!(store.metadata_calls(), 1);

        let (hits, misses, hit_rate) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
        assert!(hit_rate > 49.0 && hit_rate < 51.0);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_coalesce() {
        let (store, id) = seeded_store(Duration::from_millis(100));
        let cache = Arc::new(cache_over(Arc::clone(&store), Duration::from_secs(300)));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let id = id.clone();
                tokio::spawn(async move { cache.get(&id).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().size, 1000);
        }
        assert_eq!(store.metadata_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refreshed_once() {
        let (store, id) = seeded_store(Duration::ZERO);
        let cache = cache_over(Arc::clone(&store), Duration::from_millis(200));

        let before = cache.get(&id).await.unwrap();
        assert_eq!(store.metadata_calls(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let after = cache.get(&id).await.unwrap();
        cache.get(&id).await.unwrap();
        cache.get(&id).await.unwrap();

        assert_eq!(store.metadata_calls(), 2);
        assert!(after.retrieved_at >= before.retrieved_at);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let (store, _) = seeded_store(Duration::ZERO);
        let cache = cache_over(Arc::clone(&store), Duration::from_secs(300));
        let missing = FileId::parse("404_404").unwrap();

        assert!(matches!(cache.get(&missing).await, Err(StreamError::NotFound(_))));
        assert!(matches!(cache.get(&missing).await, Err(StreamError::NotFound(_))));
        assert_eq!(store.metadata_calls(), 2);
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let (store, id) = seeded_store(Duration::from_millis(500));
        let config = CacheConfig {
            ttl: Duration::from_secs(300),
            max_entries: None,
        };
        let cache = MetadataCache::new(store, &config, Duration::from_millis(50));

        assert!(matches!(
            cache.get(&id).await,
            Err(StreamError::UpstreamTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_poison_entry() {
        let (store, id) = seeded_store(Duration::from_millis(100));
        let cache = Arc::new(cache_over(Arc::clone(&store), Duration::from_secs(300)));

        let abandoned = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(async move { cache.get(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();

        let meta = cache.get(&id).await.unwrap();
        assert_eq!(meta.content_type, "video/mp4");
    }
}
