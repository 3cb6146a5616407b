//! Record store adapters.
//!
//! The record store is the source of truth. It owns version arbitration: a
//! save or delete whose expected version differs from the stored one is
//! rejected with [`plumb_core::StoreError::VersionConflict`], and a successful
//! save advances the version by exactly one.

pub mod in_memory;
pub mod lmdb_store;
pub mod traits;

pub use in_memory::InMemoryRecordStore;
pub use lmdb_store::LmdbRecordStore;
pub use traits::RecordStore;
