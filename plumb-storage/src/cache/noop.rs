//! Cache store that never holds anything.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use plumb_core::{CacheResult, Record, RecordData, RecordKey};

use super::traits::{CacheStats, CacheStore, CachedRecord};

/// Every `get` misses and every `put` is discarded.
///
/// Used where no cache backend is provisioned; reads then always fall through
/// to the record store.
#[derive(Debug, Default)]
pub struct NoopCacheStore {
    misses: AtomicU64,
}

impl NoopCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T: RecordData> CacheStore<T> for NoopCacheStore {
    async fn get(&self, _key: &RecordKey) -> CacheResult<Option<CachedRecord<T>>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, _record: &Record<T>) -> CacheResult<()> {
        Ok(())
    }

    async fn evict(&self, _key: &RecordKey) -> CacheResult<bool> {
        Ok(false)
    }

    async fn clear(&self) -> CacheResult<u64> {
        Ok(0)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats {
            misses: self.misses.load(Ordering::Relaxed),
            ..CacheStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_is_discarded() {
        let cache = NoopCacheStore::new();
        let key = RecordKey::new("P1").unwrap();
        CacheStore::<u32>::put(&cache, &Record::initial(key.clone(), 1)).await.unwrap();

        let cached: Option<CachedRecord<u32>> = cache.get(&key).await.unwrap();
        assert!(cached.is_none());
        let stats = CacheStore::<u32>::stats(&cache).await.unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
    }
}
