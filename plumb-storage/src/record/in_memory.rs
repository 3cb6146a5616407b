//! In-memory record store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use plumb_core::{Record, RecordData, RecordKey, StoreError, StoreResult, Version};

use super::traits::RecordStore;

/// Record store backed by a `RwLock<HashMap>`.
///
/// Compare-and-swap happens entirely inside the write lock, so concurrent
/// saves against the same key are linearized and exactly one of them wins per
/// version. Clones share the same underlying map.
#[derive(Debug)]
pub struct InMemoryRecordStore<T> {
    records: Arc<RwLock<HashMap<RecordKey, Record<T>>>>,
}

impl<T> Clone for InMemoryRecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<T> Default for InMemoryRecordStore<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: RecordData> InMemoryRecordStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`, versions kept as given.
    pub fn with_records(records: impl IntoIterator<Item = Record<T>>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        Self {
            records: Arc::new(RwLock::new(map)),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: RecordData> RecordStore<T> for InMemoryRecordStore<T> {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Record<T>>> {
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn insert(&self, key: &RecordKey, data: T) -> StoreResult<Record<T>> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        if records.contains_key(key) {
            return Err(StoreError::AlreadyExists { key: key.clone() });
        }
        let record = Record::initial(key.clone(), data);
        records.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn save(&self, record: Record<T>, expected: Version) -> StoreResult<Record<T>> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let current = records
            .get_mut(&record.key)
            .ok_or_else(|| StoreError::NotFound {
                key: record.key.clone(),
            })?;

        if current.version != expected {
            return Err(StoreError::VersionConflict {
                key: record.key.clone(),
                expected,
                actual: current.version,
            });
        }

        let next = expected
            .next()
            .ok_or_else(|| StoreError::version_exhausted(&record.key, expected))?;
        let saved = Record::new(record.key, next, record.data, Utc::now());
        *current = saved.clone();
        Ok(saved)
    }

    async fn delete(&self, key: &RecordKey, expected: Version) -> StoreResult<()> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let actual = records
            .get(key)
            .map(|r| r.version)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        if actual != expected {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected,
                actual,
            });
        }

        records.remove(key);
        Ok(())
    }
}
