//! Shared LMDB plumbing for the heed-backed record store and cache store.
//!
//! Both stores keep a single unnamed database of raw bytes per environment and
//! run every mutation inside one write transaction.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use plumb_core::{CacheError, StoreError};

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmdbError {
    pub(crate) fn txn(e: heed::Error) -> Self {
        Self::Transaction(e.to_string())
    }
}

impl From<LmdbError> for StoreError {
    fn from(e: LmdbError) -> Self {
        StoreError::Backend {
            reason: e.to_string(),
        }
    }
}

impl From<LmdbError> for CacheError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::Serialization(reason) | LmdbError::Deserialization(reason) => {
                CacheError::Serialization { reason }
            }
            other => CacheError::Backend {
                reason: other.to_string(),
            },
        }
    }
}

/// Open (creating if needed) an environment at `path` with its default database.
///
/// `max_size_mb` bounds the memory map. Each path may only be opened once per
/// process, so stores that need separate data live in separate directories.
pub(crate) fn open_env<P: AsRef<Path>>(
    path: P,
    max_size_mb: usize,
) -> Result<(Env, Database<Bytes, Bytes>), LmdbError> {
    std::fs::create_dir_all(&path)?;

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(max_size_mb * 1024 * 1024)
            .max_dbs(1)
            .open(path.as_ref())
    }
    .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

    let mut wtxn = env.write_txn().map_err(LmdbError::txn)?;
    let db: Database<Bytes, Bytes> = env
        .create_database(&mut wtxn, None)
        .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
    wtxn.commit().map_err(LmdbError::txn)?;

    Ok((env, db))
}
