//! In-process implementation of [`SharedStore`].
//!
//! Gives a single instance the same semantics as the Redis tier (expiry,
//! conditional set, counters) without a network hop. Several engines built
//! on one `Arc<MemoryStore>` behave like several processes sharing Redis,
//! except that published invalidations go nowhere.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::SharedStore;
use crate::error::{CacheError, CacheResult};

#[derive(Clone, Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            // a TTL past the clock's range never expires
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// DashMap-backed shared store.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.data.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, v| v.is_expired());
        }
        None
    }

    fn increment(&self, key: &str) -> CacheResult<i64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                // INCR keeps an existing expiry
                let (current, expires_at) = if occupied.get().is_expired() {
                    (0, None)
                } else {
                    (parse_counter(&occupied.get().data)?, occupied.get().expires_at)
                };
                let next = current + 1;
                occupied.insert(StoredValue {
                    data: next.to_string().into_bytes(),
                    expires_at,
                });
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(b"1".to_vec(), None));
                Ok(1)
            }
        }
    }
}

fn parse_counter(data: &[u8]) -> CacheResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CacheError::store_unavailable("value is not an integer or out of range"))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.read(key))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value.to_vec(), Some(ttl)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value.to_vec(), Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value.to_vec(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired() && v.data == expected)
            .is_some())
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.increment(key)
    }

    async fn incr_many(&self, keys: &[String]) -> CacheResult<Vec<i64>> {
        keys.iter().map(|key| self.increment(key)).collect()
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        Ok(keys
            .iter()
            .map(|key| {
                self.read(key)
                    .and_then(|data| String::from_utf8(data).ok())
            })
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> CacheResult<()> {
        tracing::trace!(channel, message, "publish ignored by in-process store");
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}
