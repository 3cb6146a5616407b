//! Record store trait.

use async_trait::async_trait;
use plumb_core::{Record, RecordData, RecordKey, StoreResult, Version};

/// Durable, versioned storage for records of type `T`.
///
/// Implementations must be safe to share across tasks. Compare-and-swap
/// semantics are mandatory: `save` and `delete` succeed only when the stored
/// version equals `expected`.
#[async_trait]
pub trait RecordStore<T: RecordData>: Send + Sync {
    /// Load the current record, or `None` if the key is absent.
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Record<T>>>;

    /// Insert a new record at [`Version::INITIAL`].
    ///
    /// Fails with `AlreadyExists` if the key is taken.
    async fn insert(&self, key: &RecordKey, data: T) -> StoreResult<Record<T>>;

    /// Persist `record` if the stored version still equals `expected`.
    ///
    /// The version carried by `record` is ignored; the stored result always
    /// has version `expected.next()`. Returns `NotFound` if the key vanished,
    /// `VersionConflict` if another writer got there first and `Backend` if
    /// the version counter is exhausted.
    async fn save(&self, record: Record<T>, expected: Version) -> StoreResult<Record<T>>;

    /// Remove the record if the stored version still equals `expected`.
    async fn delete(&self, key: &RecordKey, expected: Version) -> StoreResult<()>;
}
