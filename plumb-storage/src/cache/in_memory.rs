//! In-memory TTL cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plumb_core::{CacheError, CacheResult, Record, RecordData, RecordKey};

use super::traits::{CacheStats, CacheStore, CachedRecord};

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Process-local cache with a fixed TTL per entry.
///
/// Expired entries are dropped lazily when read, or in bulk by
/// [`InMemoryCacheStore::purge_expired`]. Clones share entries and counters,
/// which is how several engine instances share one cache in tests.
#[derive(Debug)]
pub struct InMemoryCacheStore<T> {
    entries: Arc<RwLock<HashMap<RecordKey, CachedRecord<T>>>>,
    counters: Arc<Counters>,
    ttl: Duration,
}

impl<T> Clone for InMemoryCacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
            ttl: self.ttl,
        }
    }
}

fn poisoned() -> CacheError {
    CacheError::Backend {
        reason: "cache lock poisoned".to_string(),
    }
}

impl<T: RecordData> InMemoryCacheStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a live or expired entry is physically present for `key`.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    /// Drop every expired entry. Returns the number dropped.
    pub fn purge_expired(&self) -> CacheResult<u64> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.ttl));
        let purged = (before - entries.len()) as u64;
        self.counters.expirations.fetch_add(purged, Ordering::Relaxed);
        if purged > 0 {
            tracing::debug!(purged, "Purged expired cache entries");
        }
        Ok(purged)
    }

    fn expire(&self, key: &RecordKey) -> CacheResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        // Another task may have refreshed the entry since it was read.
        if entries.get(key).is_some_and(|e| e.is_expired(self.ttl)) {
            entries.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: RecordData> CacheStore<T> for InMemoryCacheStore<T> {
    async fn get(&self, key: &RecordKey) -> CacheResult<Option<CachedRecord<T>>> {
        let found = {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            entries.get(key).cloned()
        };

        match found {
            Some(entry) if !entry.is_expired(self.ttl) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Some(_) => {
                self.expire(key)?;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, record: &Record<T>) -> CacheResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(
            record.key.clone(),
            CachedRecord::new(record.clone(), Utc::now()),
        );
        Ok(())
    }

    async fn evict(&self, key: &RecordKey) -> CacheResult<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let removed = entries.remove(key).is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<u64> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let removed = entries.len() as u64;
        entries.clear();
        self.counters.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self.entries.read().map_err(|_| poisoned())?.len() as u64;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        })
    }
}
