//! Shared (L2) layer.
//!
//! Wraps the shared store and absorbs its failures: a read that cannot reach
//! the store is a miss, a write that cannot reach it is dropped with a
//! warning. While the store is down every lookup falls through to the
//! producer, so the data source behind it must be sized for that.

use std::time::Duration;

use crate::store::DynStore;

#[derive(Clone)]
pub struct SharedLayer {
    store: DynStore,
    prefix: String,
}

impl SharedLayer {
    pub fn new(store: DynStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    /// Store key for a cache key, e.g. `cache:data:users:42`.
    #[inline]
    pub fn data_key(&self, key: &str) -> String {
        format!("{}data:{key}", self.prefix)
    }

    /// Store key of the regeneration lease for a cache key.
    #[inline]
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}lock:{key}", self.prefix)
    }

    /// Store key of a tag's version counter.
    #[inline]
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.prefix)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get(&self.data_key(key)).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 GET failed, treating as miss");
                None
            }
        }
    }

    /// Write with expiry. Returns whether the store accepted the write.
    pub async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        match self.store.set_ex(&self.data_key(key), value, ttl).await {
            Ok(()) => {
                tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "L2 set");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 SET failed, value not shared");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.store.del(&self.data_key(key)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 DEL failed");
                false
            }
        }
    }

    /// Best-effort publish of an invalidated key to other instances.
    pub async fn publish_invalidation(&self, channel: &str, key: &str) {
        match self.store.publish(channel, key).await {
            Ok(()) => tracing::debug!(key = %key, channel, "published cache invalidation"),
            Err(e) => tracing::warn!(key = %key, error = %e, "failed to publish invalidation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_prefixes_keys_in_store() {
        let store = Arc::new(MemoryStore::new());
        let layer = SharedLayer::new(store.clone(), "app:");

        assert!(
            layer
                .set_with_expiry("users:1", b"{}", Duration::from_secs(5))
                .await
        );
        assert_eq!(layer.get("users:1").await, Some(b"{}".to_vec()));
        assert_eq!(store.get("app:data:users:1").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(layer.lock_key("users:1"), "app:lock:users:1");
        assert_eq!(layer.tag_key("users"), "app:tag:users");

        assert!(layer.delete("users:1").await);
        assert_eq!(layer.get("users:1").await, None);
    }
}
