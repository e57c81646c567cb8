//! Plain two-tier fetch with stampede protection.
//!
//! ## Lookup Order
//!
//! ```text
//! fetch → L1 (local) → L2 (shared) → lease → producer
//!           hit ↩        hit ↩ (promote to L1)
//! ```
//!
//! On a double miss exactly one caller per lease window runs the producer;
//! the rest poll L2 for its result.
//!
//! L2 values carry their absolute expiry, so a copy promoted into L1 never
//! outlives the entry it came from. Expiry is wall-clock based and assumes
//! instances sharing a store keep their clocks roughly in sync.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::CacheConfig;
use crate::error::{CacheError, FetchError};
use crate::local::LocalCache;
use crate::metrics::{CacheMetrics, CacheStats, Tier};
use crate::shared::SharedLayer;
use crate::stampede::StampedeGuard;
use crate::store::DynStore;

/// Stored form of a plain value in both tiers.
#[derive(Debug, Serialize, Deserialize)]
struct SharedEntry<T> {
    value: T,
    /// Unix timestamp in milliseconds after which the value is stale
    expires_at: i64,
}

impl<T> SharedEntry<T> {
    /// Time left before expiry, `None` once expired.
    fn remaining(&self) -> Option<Duration> {
        let left = self.expires_at.saturating_sub(now_millis());
        (left > 0).then(|| Duration::from_millis(left as u64))
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Two-tier cache: process-local L1 in front of the shared L2.
#[derive(Clone)]
pub struct TieredCache {
    local: Arc<LocalCache>,
    shared: SharedLayer,
    guard: StampedeGuard,
    metrics: Arc<CacheMetrics>,
    local_ttl: Duration,
    invalidation_channel: String,
}

impl TieredCache {
    pub fn new(store: DynStore, config: &CacheConfig) -> Self {
        let shared = SharedLayer::new(store.clone(), config.key_prefix.clone());
        Self {
            local: Arc::new(LocalCache::new(config.local.capacity)),
            shared,
            guard: StampedeGuard::new(store, &config.stampede),
            metrics: Arc::new(CacheMetrics::new()),
            local_ttl: config.local.ttl(),
            invalidation_channel: config.invalidation_channel.clone(),
        }
    }

    /// The L1 map, shared with the invalidation listener and sweeper.
    pub fn local_cache(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn shared(&self) -> &SharedLayer {
        &self.shared
    }

    /// Return the cached value for `key`, generating it with `producer` on a miss.
    ///
    /// The producer runs at most once per lease window across all instances
    /// sharing the store. Callers that lose the race wait up to the
    /// configured deadline and then fail with
    /// [`CacheError::GenerationTimeout`]. Producer errors are returned as
    /// [`FetchError::Producer`], after the lease has been released.
    pub async fn fetch<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, FetchError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // 1. L1
        if let Some(data) = self.local.get(key) {
            match decode::<T>(key, &data) {
                Some(entry) if entry.remaining().is_some() => {
                    tracing::debug!(key = %key, "cache hit (L1)");
                    self.metrics.record_hit(Tier::L1);
                    return Ok(entry.value);
                }
                _ => {
                    self.local.delete(key);
                }
            }
        }

        // 2. L2
        if let Some(value) = self.read_shared::<T>(key).await {
            tracing::debug!(key = %key, "cache hit (L2)");
            self.metrics.record_hit(Tier::L2);
            return Ok(value);
        }

        tracing::debug!(key = %key, "cache miss");
        self.metrics.record_miss();

        // 3. single-flight regeneration
        let lock_key = self.shared.lock_key(key);
        match self.guard.try_acquire(&lock_key).await {
            Ok(Some(lease)) => {
                // the previous holder may have finished between our L2 read and the acquire
                if let Some(value) = self.read_shared::<T>(key).await {
                    lease.release().await;
                    return Ok(value);
                }
                let result = self.regenerate(key, ttl, producer).await;
                lease.release().await;
                result
            }
            Ok(None) => {
                let this = self;
                let value = self
                    .guard
                    .wait_for(key, move || this.read_shared::<T>(key))
                    .await?;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "lease unavailable, regenerating without lock");
                self.regenerate(key, ttl, producer).await
            }
        }
    }

    /// Remove `key` from both tiers and tell other instances to drop it from their L1.
    pub async fn delete(&self, key: &str) {
        self.local.delete(key);
        self.shared.delete(key).await;
        self.shared
            .publish_invalidation(&self.invalidation_channel, key)
            .await;
    }

    /// Hit/miss counters for this instance.
    pub fn stats(&self) -> CacheStats {
        self.metrics
            .snapshot(self.local.len(), self.shared.store().mode())
    }

    /// Run the producer and write the result through to L2, then L1.
    async fn regenerate<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, FetchError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = producer().await.map_err(FetchError::Producer)?;
        let data = Arc::new(encode(&value, ttl)?);

        self.shared.set_with_expiry(key, &data, ttl).await;
        self.local.set(key, data, ttl.min(self.local_ttl));
        tracing::debug!(key = %key, "cache set (L1+L2)");
        Ok(value)
    }

    /// Read and decode from L2, promoting a live hit into L1 for no longer
    /// than the entry has left.
    async fn read_shared<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.shared.get(key).await?;
        let Some(entry) = decode::<T>(key, &data) else {
            self.shared.delete(key).await;
            return None;
        };
        let remaining = entry.remaining()?;
        self.local.set(key, Arc::new(data), remaining.min(self.local_ttl));
        Some(entry.value)
    }
}

fn encode<T: Serialize>(value: &T, ttl: Duration) -> Result<Vec<u8>, CacheError> {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let entry = SharedEntry {
        value,
        expires_at: now_millis().saturating_add(ttl_ms),
    };
    Ok(serde_json::to_vec(&entry)?)
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Option<SharedEntry<T>> {
    match serde_json::from_slice(data) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to deserialize cached value, treating as miss");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> CacheConfig {
        let mut config = CacheConfig::default();
        config.local.capacity = 16;
        config.stampede.poll_interval_ms = 10;
        config.stampede.wait_timeout_ms = 2000;
        config
    }

    fn cache_on(store: Arc<MemoryStore>) -> TieredCache {
        TieredCache::new(store, &test_config())
    }

    #[tokio::test]
    async fn test_second_fetch_served_from_cache() {
        let cache = cache_on(Arc::new(MemoryStore::new()));

        let first: String = cache
            .fetch("greeting", Duration::from_secs(60), || async {
                Ok::<_, Infallible>("hello".to_string())
            })
            .await
            .unwrap();
        let second: String = cache
            .fetch("greeting", Duration::from_secs(60), || async {
                Ok::<_, Infallible>("bonjour".to_string())
            })
            .await
            .unwrap();

        assert_eq!(first, "hello");
        assert_eq!(second, "hello");

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l2_hits, 0);
        assert_eq!(stats.l1_entries, 1);
        assert_eq!(stats.mode, "memory");
    }

    #[tokio::test]
    async fn test_l2_hit_is_promoted_to_l1() {
        let store = Arc::new(MemoryStore::new());
        let writer = cache_on(store.clone());
        let reader = cache_on(store);

        writer
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(7u32) })
            .await
            .unwrap();

        for _ in 0..2 {
            let value: u32 = reader
                .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(8u32) })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        let stats = reader.stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_producer_error_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());

        let err = cache
            .fetch::<u32, _, _, _>("k", Duration::from_secs(60), || async {
                Err(std::io::Error::other("backend down"))
            })
            .await
            .unwrap_err();
        let FetchError::Producer(inner) = err else {
            panic!("expected producer error");
        };
        assert_eq!(inner.to_string(), "backend down");

        let lock_key = cache.shared().lock_key("k");
        assert!(store.get(&lock_key).await.unwrap().is_none());

        let value: u32 = cache
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(1u32) })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_waiter_times_out_while_lease_held() {
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.stampede.wait_timeout_ms = 100;
        let cache = TieredCache::new(store.clone(), &config);

        // another instance holds the lease and never finishes
        store
            .set_nx_ex(&cache.shared().lock_key("slow"), b"other", Duration::from_secs(30))
            .await
            .unwrap();

        let calls = &AtomicUsize::new(0);
        let err = cache
            .fetch::<u32, Infallible, _, _>("slow", Duration::from_secs(60), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_waiter_observes_value_written_by_holder() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        let lock_key = cache.shared().lock_key("k");
        store
            .set_nx_ex(&lock_key, b"other", Duration::from_secs(30))
            .await
            .unwrap();

        let holder = {
            let store = store.clone();
            let data_key = cache.shared().data_key("k");
            let data = encode(&42u32, Duration::from_secs(60)).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store
                    .set_ex(&data_key, &data, Duration::from_secs(60))
                    .await
                    .unwrap();
                store.del_if_eq(&lock_key, b"other").await.unwrap();
            })
        };

        let value: u32 = cache
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(0u32) })
            .await
            .unwrap();
        holder.await.unwrap();

        assert_eq!(value, 42);
        assert_eq!(cache.local_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_regenerated() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        store
            .set_ex(&cache.shared().data_key("k"), b"not json", Duration::from_secs(60))
            .await
            .unwrap();

        let value: u32 = cache
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(5u32) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        let stored = store.get(&cache.shared().data_key("k")).await.unwrap().unwrap();
        assert_eq!(decode::<u32>("k", &stored).map(|entry| entry.value), Some(5));
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        cache
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(1u32) })
            .await
            .unwrap();

        cache.delete("k").await;

        assert!(cache.local_cache().get("k").is_none());
        assert!(store.get(&cache.shared().data_key("k")).await.unwrap().is_none());

        let value: u32 = cache
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(2u32) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_promoted_entry_expires_with_shared_entry() {
        let store = Arc::new(MemoryStore::new());
        let writer = cache_on(store.clone());
        let reader = cache_on(store);

        writer
            .fetch("k", Duration::from_millis(100), || async { Ok::<_, Infallible>(1u32) })
            .await
            .unwrap();
        let promoted: u32 = reader
            .fetch("k", Duration::from_secs(60), || async { Ok::<_, Infallible>(2u32) })
            .await
            .unwrap();
        assert_eq!(promoted, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reader.local_cache().get("k").is_none());
    }

    #[test]
    fn test_entry_remaining_time() {
        let live: SharedEntry<u32> =
            decode("k", &encode(&1u32, Duration::from_secs(60)).unwrap()).unwrap();
        let left = live.remaining().unwrap();
        assert!(left > Duration::from_secs(59) && left <= Duration::from_secs(60));

        let expired = SharedEntry {
            value: 1u32,
            expires_at: now_millis() - 1,
        };
        assert!(expired.remaining().is_none());

        // a huge TTL saturates instead of overflowing
        let forever: SharedEntry<u32> =
            decode("k", &encode(&1u32, Duration::MAX).unwrap()).unwrap();
        assert_eq!(forever.expires_at, i64::MAX);
    }
}
