//! Cache store trait and entry types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plumb_core::{CacheResult, Record, RecordData, RecordKey, Timestamp};

/// Cache store for snapshots of records of type `T`.
///
/// Implementations should be thread-safe and support concurrent access.
/// Expired entries must never be returned from `get`.
#[async_trait]
pub trait CacheStore<T: RecordData>: Send + Sync {
    /// Get a live entry, or `None` if absent or expired.
    async fn get(&self, key: &RecordKey) -> CacheResult<Option<CachedRecord<T>>>;

    /// Cache a snapshot of `record`, stamped with the current time.
    async fn put(&self, record: &Record<T>) -> CacheResult<()>;

    /// Remove the entry for `key`. Returns whether an entry was present.
    ///
    /// Evicting an absent key is not an error.
    async fn evict(&self, key: &RecordKey) -> CacheResult<bool>;

    /// Remove every entry. Returns the number of entries removed.
    async fn clear(&self) -> CacheResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// A record snapshot as held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord<T> {
    pub record: Record<T>,
    pub cached_at: Timestamp,
}

impl<T> CachedRecord<T> {
    pub fn new(record: Record<T>, cached_at: Timestamp) -> Self {
        Self { record, cached_at }
    }

    /// How long ago this snapshot was cached, clamped at zero.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the entry has outlived `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }

    pub fn into_record(self) -> Record<T> {
        self.record
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of live entries returned by `get`.
    pub hits: u64,
    /// Number of `get` calls that found nothing live.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries removed by `evict` or `clear`.
    pub evictions: u64,
    /// Number of entries dropped because their TTL elapsed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
