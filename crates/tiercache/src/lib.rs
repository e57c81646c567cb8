//! Two-tier caching for horizontally scaled services.
//!
//! ## Architecture
//!
//! - **L1 (local)**: bounded in-process map, microsecond latency, per-instance
//! - **L2 (Redis)**: network, millisecond latency, shared across instances
//! - **Stampede guard**: lease in L2 so only one instance regenerates a missing key
//! - **Tag versions**: counters in L2 that invalidate whole groups of tagged entries
//! - **Pub/Sub**: cross-instance L1 invalidation on delete
//!
//! ## Cache Hierarchy
//!
//! ```text
//! fetch → L1 → L2 → lease → producer (DB/API)
//!          ↓     ↓       ↘ waiters poll L2
//!      <1µs  ~1ms        ~producer latency
//! ```
//!
//! ## Graceful Degradation
//!
//! Shared-store failures never reach the caller: reads become misses and
//! writes are dropped with a warning. With Redis down every fetch runs its
//! producer.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod pubsub;
pub mod shared;
pub mod stampede;
pub mod store;
pub mod tagged;
pub mod tags;

use std::sync::Arc;

pub use cache::TieredCache;
pub use config::{CacheConfig, ConfigError, LocalCacheConfig, RedisConfig, StampedeConfig, TagConfig};
pub use engine::CacheEngine;
pub use error::{CacheError, CacheResult, FetchError};
pub use local::LocalCache;
pub use metrics::{CacheStats, Tier};
pub use store::{DynStore, MemoryStore, RedisStore, SharedStore};
pub use tagged::TaggedCache;

/// Create the cache engine described by `config`.
///
/// ## Store Selection
///
/// - **Redis disabled**: in-process store; correct for a single instance only
/// - **Redis enabled**: pooled Redis client, plus the pub/sub listener that
///   keeps L1 in step with deletes from other instances
///
/// An unreachable Redis at startup is logged and the engine runs degraded
/// until it comes back. A URL that cannot even build a pool falls back to
/// the in-process store.
pub async fn connect(config: &CacheConfig) -> Result<CacheEngine, ConfigError> {
    config.validate().map_err(ConfigError::Invalid)?;

    let (store, redis_url) = open_store(config).await;

    let engine = CacheEngine::new(store, config);

    if let Some(redis_url) = redis_url {
        engine.attach_task(
            pubsub::InvalidationListener {
                redis_url,
                channel: config.invalidation_channel.clone(),
                local_cache: engine.local_cache().clone(),
            }
            .start(),
        );
    }

    if let Some(interval) = config.local.sweep_interval() {
        engine.attach_task(local::spawn_sweeper(engine.local_cache(), interval));
    }

    Ok(engine)
}

/// Pick the shared store. Returns the Redis URL when Redis is in use.
async fn open_store(config: &CacheConfig) -> (DynStore, Option<String>) {
    if !config.redis.enabled {
        tracing::info!("Redis disabled, using in-process shared store");
        let store: DynStore = Arc::new(MemoryStore::new());
        return (store, None);
    }

    tracing::info!(url = %config.redis.url, "Connecting to Redis");
    match RedisStore::from_config(&config.redis) {
        Ok(redis_store) => {
            match redis_store.ping().await {
                Ok(()) => tracing::info!("Connected to Redis"),
                Err(e) => tracing::warn!(
                    error = %e,
                    "Redis unreachable at startup, cache runs degraded until it recovers"
                ),
            }
            let url = redis_store.url().to_string();
            let store: DynStore = Arc::new(redis_store);
            (store, Some(url))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process store."
            );
            let store: DynStore = Arc::new(MemoryStore::new());
            (store, None)
        }
    }
}
