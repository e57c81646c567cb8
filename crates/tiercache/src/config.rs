use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level cache configuration.
///
/// Built once at startup and handed to [`crate::connect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Shared (L2) store connection
    #[serde(default)]
    pub redis: RedisConfig,
    /// Process-local (L1) cache
    #[serde(default)]
    pub local: LocalCacheConfig,
    /// Single-flight regeneration settings
    #[serde(default)]
    pub stampede: StampedeConfig,
    /// Tagged caching settings
    #[serde(default)]
    pub tags: TagConfig,
    /// Prefix applied to every key written to the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Pub/sub channel used to drop keys from other instances' L1
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
}

fn default_key_prefix() -> String {
    "cache:".to_string()
}

fn default_invalidation_channel() -> String {
    "cache:invalidate".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            local: LocalCacheConfig::default(),
            stampede: StampedeConfig::default(),
            tags: TagConfig::default(),
            key_prefix: default_key_prefix(),
            invalidation_channel: default_invalidation_channel(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.timeout_ms == 0 || self.redis.command_timeout_ms == 0 {
            return Err("redis timeouts must be > 0".into());
        }
        if self.local.capacity == 0 {
            return Err("local.capacity must be > 0".into());
        }
        if self.local.ttl_secs == 0 {
            return Err("local.ttl_secs must be > 0".into());
        }
        if self.stampede.lock_ttl_secs == 0 {
            return Err("stampede.lock_ttl_secs must be > 0".into());
        }
        if self.stampede.poll_interval_ms == 0 {
            return Err("stampede.poll_interval_ms must be > 0".into());
        }
        if self.stampede.poll_interval_ms >= self.stampede.wait_timeout_ms {
            return Err("stampede.poll_interval_ms must be < stampede.wait_timeout_ms".into());
        }
        if self.invalidation_channel.is_empty() {
            return Err("invalidation_channel must not be empty".into());
        }
        Ok(())
    }
}

/// Redis configuration for the shared tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis. When disabled an in-process store is used instead,
    /// which is only correct for single-instance deployments.
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-command timeout in milliseconds. A command that exceeds it is
    /// treated like any other store failure.
    #[serde(default = "default_redis_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    1000
}

fn default_redis_command_timeout_ms() -> u64 {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            command_timeout_ms: default_redis_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Local (L1) cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held per process
    #[serde(default = "default_local_capacity")]
    pub capacity: usize,

    /// Upper bound on how long an entry may be served from L1
    #[serde(default = "default_local_ttl_secs")]
    pub ttl_secs: u64,

    /// Period of the background expired-entry sweep. 0 disables it and
    /// leaves expiry purely lazy.
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

fn default_local_capacity() -> usize {
    10000
}

fn default_local_ttl_secs() -> u64 {
    60
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_local_capacity(),
            ttl_secs: default_local_ttl_secs(),
            sweep_interval_secs: 0,
        }
    }
}

impl LocalCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Stampede protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedeConfig {
    /// Lease length of the regeneration lock
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How often waiters re-check the shared tier
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long waiters poll before failing with a generation timeout
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_wait_timeout_ms() -> u64 {
    5000
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl StampedeConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Tagged caching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagConfig {
    /// Run tagged regeneration under the same lease as plain fetches.
    /// Default: false (tagged fetches regenerate independently)
    #[serde(default)]
    pub single_flight: bool,
}

pub mod loader {
    use super::{CacheConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Read from the working directory when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "tiercache.toml";

    /// Load configuration from an optional TOML file plus environment overrides.
    /// A missing file is skipped; defaults fill anything unset.
    ///
    /// Environment variables use the `TIERCACHE` prefix and `__` as the
    /// section separator, e.g. `TIERCACHE__REDIS__URL=redis://cache:6379`.
    pub fn load_config(path: Option<&str>) -> Result<CacheConfig, ConfigError> {
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        let mut builder = Config::builder();
        if file.exists() {
            builder = builder.add_source(File::from(file));
        }
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: CacheConfig = builder.build()?.try_deserialize()?;
        merged.validate().map_err(ConfigError::Invalid)?;
        Ok(merged)
    }
}
