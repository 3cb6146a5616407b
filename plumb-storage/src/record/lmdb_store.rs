//! LMDB-backed record store.
//!
//! Records are stored as JSON under their raw key bytes. Every
//! compare-and-swap runs inside a single LMDB write transaction; LMDB admits
//! one writer at a time, so the version check and the put cannot interleave
//! with another writer.

use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, RoTxn};
use plumb_core::{Record, RecordData, RecordKey, StoreError, StoreResult, Version};

use super::traits::RecordStore;
use crate::lmdb::{open_env, LmdbError};

/// Durable record store on top of heed.
pub struct LmdbRecordStore<T> {
    env: Env,
    db: Database<Bytes, Bytes>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: RecordData> LmdbRecordStore<T> {
    /// Open or create a record store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        let (env, db) = open_env(path, max_size_mb)?;
        Ok(Self {
            env,
            db,
            _marker: PhantomData,
        })
    }

    fn load(&self, rtxn: &RoTxn<'_>, key: &RecordKey) -> StoreResult<Option<Record<T>>> {
        let bytes = self
            .db
            .get(rtxn, key.as_bytes())
            .map_err(LmdbError::txn)?;

        bytes
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn encode(record: &Record<T>) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            key: record.key.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<T: RecordData> RecordStore<T> for LmdbRecordStore<T> {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Record<T>>> {
        let rtxn = self.env.read_txn().map_err(LmdbError::txn)?;
        self.load(&rtxn, key)
    }

    async fn insert(&self, key: &RecordKey, data: T) -> StoreResult<Record<T>> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        if self.load(&wtxn, key)?.is_some() {
            return Err(StoreError::AlreadyExists { key: key.clone() });
        }

        let record = Record::initial(key.clone(), data);
        let bytes = Self::encode(&record)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(LmdbError::txn)?;
        wtxn.commit().map_err(LmdbError::txn)?;

        Ok(record)
    }

    async fn save(&self, record: Record<T>, expected: Version) -> StoreResult<Record<T>> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let current = self
            .load(&wtxn, &record.key)?
            .ok_or_else(|| StoreError::NotFound {
                key: record.key.clone(),
            })?;

        if current.version != expected {
            return Err(StoreError::VersionConflict {
                key: record.key,
                expected,
                actual: current.version,
            });
        }

        let next = expected
            .next()
            .ok_or_else(|| StoreError::version_exhausted(&record.key, expected))?;
        let saved = Record::new(record.key, next, record.data, Utc::now());
        let bytes = Self::encode(&saved)?;
        self.db
            .put(&mut wtxn, saved.key.as_bytes(), &bytes)
            .map_err(LmdbError::txn)?;
        wtxn.commit().map_err(LmdbError::txn)?;

        Ok(saved)
    }

    async fn delete(&self, key: &RecordKey, expected: Version) -> StoreResult<()> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let current = self
            .load(&wtxn, key)?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        if current.version != expected {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected,
                actual: current.version,
            });
        }

        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(LmdbError::txn)?;
        wtxn.commit().map_err(LmdbError::txn)?;
        Ok(())
    }
}
