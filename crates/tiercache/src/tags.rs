//! Tag version index.
//!
//! Each tag owns a counter in the shared store. Entries remember the
//! counters of their tags at write time; bumping a counter makes every entry
//! carrying that tag stale at once, without knowing which keys they are.
//! A tag that was never bumped reads as version "0".

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CacheResult;
use crate::shared::SharedLayer;

/// Current version of each requested tag.
pub type TagVersions = BTreeMap<String, String>;

#[derive(Clone)]
pub struct TagIndex {
    shared: SharedLayer,
}

impl TagIndex {
    pub fn new(shared: SharedLayer) -> Self {
        Self { shared }
    }

    /// Current versions of `tags`, in one `MGET`.
    pub async fn versions(&self, tags: &BTreeSet<String>) -> CacheResult<TagVersions> {
        if tags.is_empty() {
            return Ok(TagVersions::new());
        }
        let keys: Vec<String> = tags.iter().map(|tag| self.shared.tag_key(tag)).collect();
        let values = self.shared.store().mget(&keys).await?;

        Ok(tags
            .iter()
            .zip(values)
            .map(|(tag, value)| (tag.clone(), value.unwrap_or_else(|| "0".to_string())))
            .collect())
    }

    /// Bump one tag. Returns its new version.
    pub async fn invalidate(&self, tag: &str) -> CacheResult<i64> {
        let version = self.shared.store().incr(&self.shared.tag_key(tag)).await?;
        tracing::debug!(tag = %tag, version, "tag invalidated");
        Ok(version)
    }

    /// Bump several tags in one pipelined round trip.
    pub async fn invalidate_all<S: AsRef<str>>(&self, tags: &[S]) -> CacheResult<Vec<i64>> {
        let keys: Vec<String> = tags
            .iter()
            .map(|tag| self.shared.tag_key(tag.as_ref()))
            .collect();
        let versions = self.shared.store().incr_many(&keys).await?;
        tracing::debug!(count = keys.len(), "tags invalidated");
        Ok(versions)
    }
}

/// Normalise caller-supplied tags into a sorted, de-duplicated set.
pub fn tag_set<S: AsRef<str>>(tags: &[S]) -> BTreeSet<String> {
    tags.iter().map(|t| t.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn index() -> TagIndex {
        TagIndex::new(SharedLayer::new(Arc::new(MemoryStore::new()), "t:"))
    }

    #[tokio::test]
    async fn test_unknown_tags_read_as_zero() {
        let index = index();
        let versions = index.versions(&tag_set(&["users", "orders"])).await.unwrap();
        assert_eq!(versions.get("users").map(String::as_str), Some("0"));
        assert_eq!(versions.get("orders").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_invalidate_bumps_only_that_tag() {
        let index = index();
        assert_eq!(index.invalidate("users").await.unwrap(), 1);
        assert_eq!(index.invalidate("users").await.unwrap(), 2);

        let versions = index.versions(&tag_set(&["users", "orders"])).await.unwrap();
        assert_eq!(versions["users"], "2");
        assert_eq!(versions["orders"], "0");
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let index = index();
        index.invalidate("a").await.unwrap();

        let bumped = index.invalidate_all(&["a", "b"]).await.unwrap();
        assert_eq!(bumped, vec![2, 1]);

        let versions = index.versions(&tag_set(&["a", "b"])).await.unwrap();
        assert_eq!(versions["a"], "2");
        assert_eq!(versions["b"], "1");
    }

    #[test]
    fn test_tag_set_dedupes() {
        let set = tag_set(&["b", "a", "b"]);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
