//! Tag-validated caching in the shared tier.
//!
//! A tagged entry stores its value together with the versions its tags had
//! when it was written. Reading re-checks those versions; if any tag has
//! been bumped since, the entry is deleted and the read is a miss.
//!
//! Tagged entries live only in L2: validating them needs a version lookup
//! anyway, so an L1 copy would save nothing.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult, FetchError};
use crate::shared::SharedLayer;
use crate::stampede::StampedeGuard;
use crate::tags::{TagIndex, TagVersions, tag_set};

/// Stored form of a tagged value.
#[derive(Debug, Serialize, Deserialize)]
struct TaggedEntry<T> {
    value: T,
    tag_versions: TagVersions,
    /// Unix timestamp (seconds) of the write
    stored_at: i64,
}

#[derive(Clone)]
pub struct TaggedCache {
    shared: SharedLayer,
    tags: TagIndex,
    /// Present when tagged regeneration should also be single-flight.
    guard: Option<StampedeGuard>,
}

impl TaggedCache {
    pub fn new(shared: SharedLayer, guard: Option<StampedeGuard>) -> Self {
        Self {
            tags: TagIndex::new(shared.clone()),
            shared,
            guard,
        }
    }

    /// Load `key` and check it against the current versions of `tags`.
    ///
    /// A stale entry is deleted before reporting the miss.
    pub async fn read<T: DeserializeOwned>(&self, key: &str, tags: &BTreeSet<String>) -> Option<T> {
        let data = self.shared.get(key).await?;
        let entry: TaggedEntry<T> = match serde_json::from_slice(&data) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to deserialize tagged entry");
                self.shared.delete(key).await;
                return None;
            }
        };

        let current = match self.tags.versions(tags).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "tag version lookup failed, treating as miss");
                return None;
            }
        };

        if entry.tag_versions != current {
            tracing::debug!(key = %key, "tagged entry stale, evicting");
            self.shared.delete(key).await;
            return None;
        }

        tracing::debug!(key = %key, "tagged cache hit");
        Some(entry.value)
    }

    /// Store `value` with a snapshot of the current versions of `tags`.
    pub async fn write<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        tags: &BTreeSet<String>,
        ttl: Duration,
    ) -> CacheResult<()> {
        match self.tags.versions(tags).await {
            Ok(versions) => self.write_with_versions(key, value, versions, ttl).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "tag version lookup failed, skipping write");
                Ok(())
            }
        }
    }

    /// Return the tagged value for `key`, regenerating it if absent or stale.
    ///
    /// Tag versions are snapshotted before the producer runs, so an
    /// invalidation that lands while it is running leaves the new entry stale
    /// rather than wrongly fresh.
    pub async fn fetch<T, E, F, Fut, S>(
        &self,
        key: &str,
        tags: &[S],
        ttl: Duration,
        producer: F,
    ) -> Result<T, FetchError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        S: AsRef<str>,
    {
        let tags = tag_set(tags);
        if let Some(value) = self.read::<T>(key, &tags).await {
            return Ok(value);
        }

        let Some(guard) = &self.guard else {
            return self.regenerate(key, &tags, ttl, producer).await;
        };

        let lock_key = self.shared.lock_key(key);
        match guard.try_acquire(&lock_key).await {
            Ok(Some(lease)) => {
                if let Some(value) = self.read::<T>(key, &tags).await {
                    lease.release().await;
                    return Ok(value);
                }
                let result = self.regenerate(key, &tags, ttl, producer).await;
                lease.release().await;
                result
            }
            Ok(None) => {
                let (this, tags) = (self, &tags);
                Ok(guard
                    .wait_for(key, move || this.read::<T>(key, tags))
                    .await?)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "lease unavailable, regenerating without lock");
                self.regenerate(key, &tags, ttl, producer).await
            }
        }
    }

    /// Bump one tag, invalidating every entry that carries it.
    pub async fn invalidate(&self, tag: &str) -> CacheResult<i64> {
        self.tags.invalidate(tag).await
    }

    /// Bump several tags in one round trip.
    pub async fn invalidate_all<S: AsRef<str>>(&self, tags: &[S]) -> CacheResult<Vec<i64>> {
        self.tags.invalidate_all(tags).await
    }

    async fn regenerate<T, E, F, Fut>(
        &self,
        key: &str,
        tags: &BTreeSet<String>,
        ttl: Duration,
        producer: F,
    ) -> Result<T, FetchError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let snapshot = self.tags.versions(tags).await;
        let value = producer().await.map_err(FetchError::Producer)?;

        match snapshot {
            Ok(versions) => self.write_with_versions(key, &value, versions, ttl).await?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "tag version lookup failed, value not cached");
            }
        }
        Ok(value)
    }

    async fn write_with_versions<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        tag_versions: TagVersions,
        ttl: Duration,
    ) -> CacheResult<()> {
        let entry = TaggedEntry {
            value,
            tag_versions,
            stored_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        };
        let data = serde_json::to_vec(&entry).map_err(CacheError::from)?;
        self.shared.set_with_expiry(key, &data, ttl).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StampedeConfig;
    use crate::store::{MemoryStore, SharedStore};
    use std::convert::Infallible;
    use std::sync::Arc;

    fn tagged(store: Arc<MemoryStore>) -> TaggedCache {
        TaggedCache::new(SharedLayer::new(store, "t:"), None)
    }

    async fn fetch_str(cache: &TaggedCache, key: &str, tags: &[&str], value: &str) -> String {
        let value = value.to_string();
        cache
            .fetch(key, tags, Duration::from_secs(60), move || async move {
                Ok::<_, Infallible>(value)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_until_tag_invalidated() {
        let cache = tagged(Arc::new(MemoryStore::new()));

        assert_eq!(fetch_str(&cache, "k", &["users"], "A").await, "A");
        assert_eq!(fetch_str(&cache, "k", &["users"], "B").await, "A");

        cache.invalidate("users").await.unwrap();
        assert_eq!(fetch_str(&cache, "k", &["users"], "B").await, "B");
        assert_eq!(fetch_str(&cache, "k", &["users"], "C").await, "B");
    }

    #[tokio::test]
    async fn test_tags_are_independent() {
        let cache = tagged(Arc::new(MemoryStore::new()));
        fetch_str(&cache, "user:1", &["users"], "u1").await;
        fetch_str(&cache, "order:1", &["orders"], "o1").await;

        cache.invalidate("orders").await.unwrap();

        assert_eq!(fetch_str(&cache, "user:1", &["users"], "u2").await, "u1");
        assert_eq!(fetch_str(&cache, "order:1", &["orders"], "o2").await, "o2");
    }

    #[tokio::test]
    async fn test_any_tag_invalidates_multi_tag_entry() {
        let cache = tagged(Arc::new(MemoryStore::new()));
        fetch_str(&cache, "k", &["users", "orders"], "A").await;

        cache.invalidate_all(&["orders"]).await.unwrap();
        assert_eq!(fetch_str(&cache, "k", &["users", "orders"], "B").await, "B");
    }

    #[tokio::test]
    async fn test_stale_read_deletes_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = tagged(store.clone());
        let tags = tag_set(&["users"]);

        cache
            .write("k", &1u32, &tags, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.read::<u32>("k", &tags).await, Some(1));

        cache.invalidate("users").await.unwrap();
        assert_eq!(cache.read::<u32>("k", &tags).await, None);
        assert!(store.get("t:data:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_tag_set_is_a_miss() {
        let cache = tagged(Arc::new(MemoryStore::new()));
        fetch_str(&cache, "k", &["users"], "A").await;
        assert_eq!(fetch_str(&cache, "k", &["users", "orders"], "B").await, "B");
    }

    #[tokio::test]
    async fn test_invalidation_during_production_leaves_entry_stale() {
        let cache = tagged(Arc::new(MemoryStore::new()));
        let racing = cache.clone();

        let value: String = cache
            .fetch("k", &["users"], Duration::from_secs(60), move || async move {
                racing.invalidate("users").await.unwrap();
                Ok::<_, Infallible>("computed-before-invalidation".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "computed-before-invalidation");

        assert_eq!(fetch_str(&cache, "k", &["users"], "fresh").await, "fresh");
    }

    #[tokio::test]
    async fn test_single_flight_waiter_times_out_on_held_lease() {
        let store = Arc::new(MemoryStore::new());
        let guard = StampedeGuard::new(
            store.clone(),
            &StampedeConfig {
                lock_ttl_secs: 30,
                poll_interval_ms: 10,
                wait_timeout_ms: 60,
            },
        );
        let cache = TaggedCache::new(SharedLayer::new(store.clone(), "t:"), Some(guard));
        store
            .set_nx_ex("t:lock:k", b"other", Duration::from_secs(30))
            .await
            .unwrap();

        let err = cache
            .fetch::<u32, Infallible, _, _, _>("k", &["users"], Duration::from_secs(60), || async {
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
