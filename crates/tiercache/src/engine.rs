//! The cache surface handed to request handlers.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::cache::TieredCache;
use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::local::LocalCache;
use crate::metrics::CacheStats;
use crate::stampede::StampedeGuard;
use crate::store::DynStore;
use crate::tagged::TaggedCache;

/// Plain and tagged caching over one shared store.
///
/// Construct once at startup (see [`crate::connect`]) and share by
/// reference or `Arc`; dropping it stops its background tasks.
pub struct CacheEngine {
    plain: TieredCache,
    tagged: TaggedCache,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Build an engine without background tasks.
    pub fn new(store: DynStore, config: &CacheConfig) -> Self {
        let plain = TieredCache::new(store.clone(), config);
        let guard = config
            .tags
            .single_flight
            .then(|| StampedeGuard::new(store, &config.stampede));
        let tagged = TaggedCache::new(plain.shared().clone(), guard);

        Self {
            plain,
            tagged,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Tie a background task's lifetime to this engine.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        self.background.lock().push(handle);
    }

    /// Stampede-protected fetch through L1 and L2.
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
        self.plain.fetch(key, ttl, producer).await
    }

    /// Fetch validated against the current versions of `tags`.
    pub async fn fetch_tagged<T, E, F, Fut, S>(
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
        self.tagged.fetch(key, tags, ttl, producer).await
    }

    /// Invalidate every tagged entry carrying `tag`.
    ///
    /// Returns `false` if the store could not record the bump; the failure
    /// is logged, entries stay valid until their TTL.
    pub async fn invalidate_tag(&self, tag: &str) -> bool {
        match self.tagged.invalidate(tag).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(tag = %tag, error = %e, "failed to invalidate tag");
                false
            }
        }
    }

    /// Invalidate several tags in one round trip.
    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        match self.tagged.invalidate_all(tags).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(count = tags.len(), error = %e, "failed to invalidate tags");
                false
            }
        }
    }

    /// Remove `key` from every tier and from other instances' L1.
    pub async fn delete(&self, key: &str) {
        self.plain.delete(key).await;
    }

    pub fn stats(&self) -> CacheStats {
        self.plain.stats()
    }

    /// Check if the shared store answers (for health checks).
    pub async fn is_store_available(&self) -> bool {
        self.plain.shared().store().ping().await.is_ok()
    }

    pub fn local_cache(&self) -> &std::sync::Arc<LocalCache> {
        self.plain.local_cache()
    }

    /// Stop background tasks (invalidation listener, L1 sweeper).
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::convert::Infallible;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_delete_also_drops_tagged_entry() {
        let engine = CacheEngine::new(Arc::new(MemoryStore::new()), &CacheConfig::default());
        let ttl = Duration::from_secs(60);

        let first: u32 = engine
            .fetch_tagged("k", &["users"], ttl, || async { Ok::<_, Infallible>(1) })
            .await
            .unwrap();
        engine.delete("k").await;
        let second: u32 = engine
            .fetch_tagged("k", &["users"], ttl, || async { Ok::<_, Infallible>(2) })
            .await
            .unwrap();

        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_invalidate_tags_reports_success() {
        let engine = CacheEngine::new(Arc::new(MemoryStore::new()), &CacheConfig::default());
        assert!(engine.invalidate_tag("users").await);
        assert!(engine.invalidate_tags(&["users", "orders"]).await);
        assert!(engine.is_store_available().await);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_attached_tasks() {
        let engine = CacheEngine::new(Arc::new(MemoryStore::new()), &CacheConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        engine.attach_task(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));

        engine.shutdown();
        // the sender is dropped when the task is aborted
        assert!(rx.await.is_err());
    }
}
