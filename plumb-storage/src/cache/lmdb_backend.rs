//! LMDB-backed TTL cache.
//!
//! Uses heed to provide a memory-mapped cache that survives process restarts
//! and can be shared by several processes on one host.
//!
//! # Value format
//!
//! ```text
//! [cached_at: i64 millis, little endian][record: JSON]
//! ```
//!
//! # Namespacing
//!
//! Every key is a [`NamespacedKey`], so several record namespaces can share
//! one environment and `clear` only touches the store's own namespace.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env};
use plumb_core::{CacheError, CacheResult, Record, RecordData, RecordKey};

use super::scoped_key::NamespacedKey;
use super::traits::{CacheStats, CacheStore, CachedRecord};
use crate::lmdb::{open_env, LmdbError};

const TIMESTAMP_LEN: usize = 8;

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// LMDB cache scoped to one namespace.
///
/// # Example
///
/// ```ignore
/// let cache: LmdbCacheStore<Product> =
///     LmdbCacheStore::new("/var/cache/plumb", 100, "product", Duration::from_secs(300))?;
/// cache.put(&record).await?;
/// let hit = cache.get(&record.key).await?;
/// ```
pub struct LmdbCacheStore<T> {
    env: Env,
    db: Database<Bytes, Bytes>,
    namespace: String,
    ttl: Duration,
    counters: Counters,
    _marker: PhantomData<fn() -> T>,
}

impl<T: RecordData> LmdbCacheStore<T> {
    /// Create a new LMDB cache store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    /// * `namespace` - Namespace every key of this store is scoped to
    /// * `ttl` - Lifetime of an entry after it is cached
    pub fn new<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, LmdbError> {
        let (env, db) = open_env(path, max_size_mb)?;
        Ok(Self {
            env,
            db,
            namespace: namespace.into(),
            ttl,
            counters: Counters::default(),
            _marker: PhantomData,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn encode_key(&self, key: &RecordKey) -> Vec<u8> {
        NamespacedKey::new(self.namespace.as_str(), key.clone()).encode()
    }

    fn decode_value(bytes: &[u8]) -> Result<CachedRecord<T>, LmdbError> {
        if bytes.len() < TIMESTAMP_LEN {
            return Err(LmdbError::Deserialization(format!(
                "entry too short: {} bytes",
                bytes.len()
            )));
        }

        let timestamp_bytes: [u8; TIMESTAMP_LEN] = bytes[..TIMESTAMP_LEN]
            .try_into()
            .map_err(|_| LmdbError::Deserialization("Invalid timestamp".into()))?;
        let cached_at = DateTime::from_timestamp_millis(i64::from_le_bytes(timestamp_bytes))
            .ok_or_else(|| LmdbError::Deserialization("timestamp out of range".into()))?;

        let record: Record<T> = serde_json::from_slice(&bytes[TIMESTAMP_LEN..])
            .map_err(|e| LmdbError::Deserialization(e.to_string()))?;

        Ok(CachedRecord::new(record, cached_at))
    }

    /// Iterate over keys in this store's namespace and collect them.
    fn collect_namespace_keys(&self) -> Result<Vec<Vec<u8>>, LmdbError> {
        let prefix = NamespacedKey::namespace_prefix(&self.namespace);
        let rtxn = self.env.read_txn().map_err(LmdbError::txn)?;

        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(LmdbError::txn)? {
            let (key, _) = result.map_err(LmdbError::txn)?;
            if key.starts_with(&prefix) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    /// Delete `encoded` only if it is still expired when the write lock is held.
    fn expire(&self, encoded: &[u8]) -> Result<(), LmdbError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let still_expired = match self.db.get(&wtxn, encoded).map_err(LmdbError::txn)? {
            Some(bytes) => Self::decode_value(bytes)
                .map(|entry| entry.is_expired(self.ttl))
                .unwrap_or(true),
            None => false,
        };
        if still_expired {
            self.db.delete(&mut wtxn, encoded).map_err(LmdbError::txn)?;
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(namespace = %self.namespace, "Expired cache entry removed");
        }
        wtxn.commit().map_err(LmdbError::txn)
    }
}

#[async_trait]
impl<T: RecordData> CacheStore<T> for LmdbCacheStore<T> {
    async fn get(&self, key: &RecordKey) -> CacheResult<Option<CachedRecord<T>>> {
        let encoded = self.encode_key(key);

        let entry = {
            let rtxn = self.env.read_txn().map_err(LmdbError::txn)?;
            match self.db.get(&rtxn, &encoded).map_err(LmdbError::txn)? {
                Some(bytes) => Some(Self::decode_value(bytes)?),
                None => None,
            }
        };

        match entry {
            Some(entry) if !entry.is_expired(self.ttl) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Some(_) => {
                self.expire(&encoded)?;
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
        let encoded = self.encode_key(&record.key);

        let timestamp_bytes = Utc::now().timestamp_millis().to_le_bytes();
        let value_bytes = serde_json::to_vec(record).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;

        let mut full_bytes = Vec::with_capacity(TIMESTAMP_LEN + value_bytes.len());
        full_bytes.extend_from_slice(&timestamp_bytes);
        full_bytes.extend_from_slice(&value_bytes);

        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        self.db
            .put(&mut wtxn, &encoded, &full_bytes)
            .map_err(LmdbError::txn)?;
        wtxn.commit().map_err(LmdbError::txn)?;

        Ok(())
    }

    async fn evict(&self, key: &RecordKey) -> CacheResult<bool> {
        let encoded = self.encode_key(key);

        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let deleted = self
            .db
            .delete(&mut wtxn, &encoded)
            .map_err(LmdbError::txn)?;
        wtxn.commit().map_err(LmdbError::txn)?;

        if deleted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(deleted)
    }

    async fn clear(&self) -> CacheResult<u64> {
        let keys = self.collect_namespace_keys()?;

        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).map_err(LmdbError::txn)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(LmdbError::txn)?;

        self.counters.evictions.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self.collect_namespace_keys()?.len() as u64;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        })
    }
}
