//! Process-local (L1) cache.
//!
//! Entries carry their own TTL and expire lazily on read. The cache is
//! bounded: inserting a new key while full evicts the entry that was
//! inserted (or last overwritten) longest ago. Insertion order is tracked in
//! a `BTreeMap` keyed by a monotonic sequence number, so eviction does not
//! scan the map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::gauge;
use parking_lot::Mutex;

use crate::metrics::{Tier, names};

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out a reference count instead
/// of copying the payload.
#[derive(Clone, Debug)]
pub struct LocalEntry {
    pub data: Arc<Vec<u8>>,
    pub inserted_at: Instant,
    pub ttl: Duration,
    seq: u64,
}

impl LocalEntry {
    /// Check if this entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

#[derive(Default)]
struct LocalState {
    entries: HashMap<String, LocalEntry>,
    /// insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl LocalState {
    fn remove(&mut self, key: &str) -> Option<LocalEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Bounded in-memory cache shared by all tasks of one process.
///
/// Every operation takes a short, non-async lock; nothing here ever awaits.
pub struct LocalCache {
    state: Mutex<LocalState>,
    capacity: usize,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalCache {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            capacity: capacity.max(1),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a live entry's payload; an expired entry is removed and reported absent.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(Arc::clone(&entry.data)),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            report_len(state.entries.len());
        }
        None
    }

    /// Insert or overwrite `key`.
    ///
    /// Returns the key evicted to make room, if any. Overwriting an existing
    /// key never evicts and counts as a fresh insertion for eviction order.
    pub fn set(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) -> Option<String> {
        let mut state = self.state.lock();

        let evicted = if state.remove(key).is_none() && state.entries.len() >= self.capacity {
            let evicted = state.pop_oldest();
            if evicted.is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            evicted
        } else {
            None
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.to_string());
        state.entries.insert(
            key.to_string(),
            LocalEntry {
                data,
                inserted_at: Instant::now(),
                ttl,
                seq,
            },
        );
        report_len(state.entries.len());

        if let Some(ref evicted) = evicted {
            tracing::debug!(key = %evicted, "evicted oldest L1 entry");
        }
        evicted
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove(key).is_some();
        if removed {
            report_len(state.entries.len());
        }
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        report_len(0);
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            report_len(state.entries.len());
        }
        drop(state);

        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries removed to stay within capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries removed because their TTL ran out.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

/// Publish the current L1 size. Called under the state lock so updates
/// land in the same order as the mutations.
fn report_len(len: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => Tier::L1.as_str()).set(len as f64);
}

/// Spawn a task that periodically purges expired L1 entries.
///
/// The task holds only a weak reference and stops once the cache is dropped.
pub fn spawn_sweeper(cache: &Arc<LocalCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else {
                tracing::debug!("L1 sweeper stopping, cache dropped");
                return;
            };
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "purged expired L1 entries");
            }
        }
    })
}
