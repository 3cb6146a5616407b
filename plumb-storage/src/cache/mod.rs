//! Cache store adapters.
//!
//! The cache is a best-effort accelerator in front of the record store. It
//! owns entry expiry: every entry records when it was cached and is treated
//! as absent once it is older than the store's TTL. Failures are reported to
//! the caller, who is expected to log and carry on without the cache.

pub mod in_memory;
pub mod lmdb_backend;
pub mod noop;
pub mod scoped_key;
pub mod traits;

pub use in_memory::InMemoryCacheStore;
pub use lmdb_backend::LmdbCacheStore;
pub use noop::NoopCacheStore;
pub use scoped_key::NamespacedKey;
pub use traits::{CacheStats, CacheStore, CachedRecord};
