//! Stampede protection: a lease-based lock in the shared store.
//!
//! On a miss, one caller wins a `SET NX PX` lease on the key's lock and
//! regenerates; everyone else polls the shared tier until the value shows up
//! or the wait deadline passes.
//!
//! ## Limits
//!
//! This is a lease, not consensus. If the holder stalls past the lease (GC
//! pause, partition, clock skew on the store) a second caller can take the
//! lock and regenerate as well. Callers must tolerate the occasional double
//! generation; they never observe a torn value since both writers store a
//! complete entry.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::StampedeConfig;
use crate::error::{CacheError, CacheResult};
use crate::store::DynStore;

/// Hands out regeneration leases and runs the waiter protocol.
#[derive(Clone)]
pub struct StampedeGuard {
    store: DynStore,
    lock_ttl: Duration,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl StampedeGuard {
    pub fn new(store: DynStore, config: &StampedeConfig) -> Self {
        Self {
            store,
            lock_ttl: config.lock_ttl(),
            poll_interval: config.poll_interval(),
            wait_timeout: config.wait_timeout(),
        }
    }

    /// Try to take the lease on `lock_key`.
    ///
    /// `Ok(None)` means another caller holds it. An error means the store
    /// could not be asked at all.
    pub async fn try_acquire(&self, lock_key: &str) -> CacheResult<Option<Lease>> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_nx_ex(lock_key, token.as_bytes(), self.lock_ttl)
            .await?;

        if acquired {
            tracing::debug!(lock = %lock_key, "lease acquired");
            Ok(Some(Lease {
                store: self.store.clone(),
                key: lock_key.to_string(),
                token,
                released: false,
            }))
        } else {
            tracing::debug!(lock = %lock_key, "lease held elsewhere");
            Ok(None)
        }
    }

    /// Poll with `check` every `poll_interval` until it yields a value or the
    /// wait deadline passes.
    pub async fn wait_for<T, F, Fut>(&self, key: &str, mut check: F) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.wait_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "gave up waiting for regeneration");
                return Err(CacheError::generation_timeout(key, started.elapsed()));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            if let Some(value) = check().await {
                tracing::debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "observed regenerated value");
                return Ok(value);
            }
        }
    }
}

/// A held regeneration lease.
///
/// Call [`Lease::release`] when done. If the lease is dropped without being
/// released (the holding future was cancelled or panicked), release is
/// spawned onto the current runtime; failing that, the lease simply expires.
pub struct Lease {
    store: DynStore,
    key: String,
    token: String,
    released: bool,
}

impl Lease {
    /// Release the lease if we still own it. Returns whether the lock was deleted.
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.store.del_if_eq(&self.key, self.token.as_bytes()).await {
            Ok(deleted) => {
                if !deleted {
                    tracing::warn!(lock = %self.key, "lease expired before release");
                }
                deleted
            }
            Err(e) => {
                tracing::warn!(lock = %self.key, error = %e, "failed to release lease, it will expire");
                false
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.del_if_eq(&key, token.as_bytes()).await {
                tracing::warn!(lock = %key, error = %e, "failed to release abandoned lease");
            } else {
                tracing::debug!(lock = %key, "released abandoned lease");
            }
        });
    }
}
