//! Redis Pub/Sub for cross-instance L1 invalidation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::local::LocalCache;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Keeps this instance's L1 in step with deletes made elsewhere.
///
/// ```text
/// Instance 1: cache.delete("key1")
///   ↓
/// Redis Pub/Sub: PUBLISH cache:invalidate "key1"
///   ↓
/// Instance 2: listener receives "key1" → removes from L1
/// ```
pub struct InvalidationListener {
    pub redis_url: String,
    pub channel: String,
    pub local_cache: Arc<LocalCache>,
}

impl InvalidationListener {
    /// Spawn the listener. It reconnects with exponential backoff until the
    /// returned handle is aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                match self.run().await {
                    Ok(()) => {
                        tracing::warn!("Cache invalidation stream closed, resubscribing");
                        backoff = INITIAL_BACKOFF;
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Cache invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                    }
                }
            }
        })
    }

    /// Subscribe and apply invalidations until the stream ends.
    ///
    /// `Ok` means the subscription was established and later closed; `Err`
    /// means it could not be established.
    async fn run(&self) -> Result<(), String> {
        // pub/sub needs a dedicated connection, not a pooled one
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "Subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(key) => {
                    let removed = self.local_cache.delete(&key);
                    tracing::debug!(key = %key, removed, "received cache invalidation");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse invalidation message payload");
                }
            }
        }
        Ok(())
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
