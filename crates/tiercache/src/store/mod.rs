//! Shared key-value store abstraction.
//!
//! The cache only needs a handful of primitives from the shared tier. They
//! are collected in [`SharedStore`] so the engine can run against Redis in
//! production and against an in-process map for single-instance deployments
//! and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Primitives consumed from the shared store.
///
/// Every method is a single round trip. Implementations report connectivity
/// problems as [`crate::CacheError::StoreUnavailable`]; deciding whether to
/// absorb them is up to the caller.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// `SET key value PX ttl`
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// `SET key value NX PX ttl`. Returns `true` if the key was written.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// `DEL key`
    async fn del(&self, key: &str) -> CacheResult<()>;

    /// Delete `key` only while it still holds `expected`. Returns `true` if deleted.
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// `INCR key`
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Pipelined `INCR` of every key, in one round trip.
    async fn incr_many(&self, keys: &[String]) -> CacheResult<Vec<i64>>;

    /// `MGET key...` as UTF-8 strings, positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// `PUBLISH channel message`
    async fn publish(&self, channel: &str, message: &str) -> CacheResult<()>;

    /// Cheap liveness check.
    async fn ping(&self) -> CacheResult<()>;

    /// Short label for logs and stats ("redis", "memory").
    fn mode(&self) -> &'static str;
}

/// Shared handle to a store implementation.
pub type DynStore = Arc<dyn SharedStore>;
