//! Error types for cache operations.
//!
//! Store connectivity faults are absorbed inside the cache (logged and
//! treated as a miss); only timeouts, serialization failures on write and
//! producer failures ever reach the caller.

use std::time::Duration;

/// Errors raised by the cache itself.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The shared store could not be reached or rejected a command.
    #[error("Shared store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the underlying failure.
        message: String,
    },

    /// Waited for another instance to regenerate a key, but it never showed up.
    #[error("Timed out after {waited:?} waiting for '{key}' to be regenerated")]
    GenerationTimeout {
        /// The key being waited on.
        key: String,
        /// How long the waiter polled before giving up.
        waited: Duration,
    },

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Creates a new `StoreUnavailable` error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `GenerationTimeout` error.
    #[must_use]
    pub fn generation_timeout(key: impl Into<String>, waited: Duration) -> Self {
        Self::GenerationTimeout {
            key: key.into(),
            waited,
        }
    }

    /// Whether the caller may reasonably retry the request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GenerationTimeout { .. } | Self::StoreUnavailable { .. }
        )
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::store_unavailable(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::store_unavailable(format!("failed to get Redis connection: {err}"))
    }
}

/// Error returned from a fetch: either the cache failed, or the producer did.
///
/// Producer errors are handed back untouched so the caller can decide how to
/// map them.
#[derive(Debug, thiserror::Error)]
pub enum FetchError<E> {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Producer failed: {0}")]
    Producer(E),
}

impl<E> FetchError<E> {
    /// Returns the producer's error, if that is what failed.
    pub fn into_producer(self) -> Option<E> {
        match self {
            FetchError::Producer(e) => Some(e),
            FetchError::Cache(_) => None,
        }
    }

    /// Whether this is a stampede wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Cache(CacheError::GenerationTimeout { .. }))
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CacheError::generation_timeout("k", Duration::from_secs(5)).is_retryable());
        assert!(CacheError::store_unavailable("down").is_retryable());

        let ser = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!CacheError::from(ser).is_retryable());
    }

    #[test]
    fn test_fetch_error_keeps_producer_error() {
        let err: FetchError<std::io::Error> =
            FetchError::Producer(std::io::Error::other("db down"));
        assert!(!err.is_timeout());
        let inner = err.into_producer().expect("producer error");
        assert_eq!(inner.to_string(), "db down");
    }

    #[test]
    fn test_timeout_display() {
        let err = CacheError::generation_timeout("users:1", Duration::from_millis(5000));
        assert_eq!(
            err.to_string(),
            "Timed out after 5s waiting for 'users:1' to be regenerated"
        );
    }
}
