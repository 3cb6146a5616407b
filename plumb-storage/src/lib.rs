//! PLUMB Storage - Record Store and Cache Store Adapters
//!
//! Defines the two storage seams the consistency engine is written against:
//! the durable, versioned [`RecordStore`] and the best-effort TTL
//! [`CacheStore`]. Each comes with an in-memory implementation and an
//! LMDB implementation built on heed.

pub mod cache;
pub mod lmdb;
pub mod record;

pub use cache::{
    CacheStats, CacheStore, CachedRecord, InMemoryCacheStore, LmdbCacheStore, NamespacedKey,
    NoopCacheStore,
};
pub use lmdb::LmdbError;
pub use record::{InMemoryRecordStore, LmdbRecordStore, RecordStore};
