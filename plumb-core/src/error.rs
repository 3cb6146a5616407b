//! Error types for PLUMB operations

use crate::{RecordKey, Version};
use thiserror::Error;

/// Record store errors.
///
/// `VersionConflict` is the only variant the write path retries; every other
/// variant is terminal for the operation that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {key}")]
    NotFound { key: RecordKey },

    #[error("Record already exists: {key}")]
    AlreadyExists { key: RecordKey },

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: RecordKey,
        expected: Version,
        actual: Version,
    },

    #[error("Store backend failure: {reason}")]
    Backend { reason: String },

    #[error("Record serialization failed for {key}: {reason}")]
    Serialization { key: RecordKey, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// The record's version counter cannot advance any further.
    pub fn version_exhausted(key: &RecordKey, version: Version) -> Self {
        Self::Backend {
            reason: format!("version counter exhausted for {key} at {version}"),
        }
    }

    /// Returns true for the optimistic-lock rejection.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Cache store errors. Never surfaced by engine operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },

    #[error("Cache serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Event bus errors. Never surfaced by engine operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Subscription closed for topic {topic}")]
    Closed { topic: String },

    #[error("Event codec failure: {reason}")]
    Codec { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Errors returned by consistency engine operations.
///
/// Only store-of-record failures and exhausted optimistic-lock retries reach
/// the caller. Cache and bus failures are absorbed by the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("Record not found: {key}")]
    NotFound { key: RecordKey },

    #[error("Record already exists: {key}")]
    AlreadyExists { key: RecordKey },

    #[error("Resource {key} modified concurrently, retry the operation (gave up after {attempts} attempts)")]
    ConflictExhausted { key: RecordKey, attempts: u32 },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl ConsistencyError {
    /// Whether the caller may simply retry the whole operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConflictExhausted { .. })
    }
}

impl From<StoreError> for ConsistencyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => Self::NotFound { key },
            StoreError::AlreadyExists { key } => Self::AlreadyExists { key },
            other => Self::Store(other),
        }
    }
}

/// Result type alias for engine operations.
pub type PlumbResult<T> = Result<T, ConsistencyError>;

/// Result type alias for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for event bus operations.
pub type BusResult<T> = Result<T, BusError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> RecordKey {
        RecordKey::new(raw).unwrap()
    }

    #[test]
    fn test_version_conflict_display() {
        let err = StoreError::VersionConflict {
            key: key("P1"),
            expected: Version::new(2),
            actual: Version::new(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("P1"));
        assert!(msg.contains("expected 2"));
        assert!(msg.contains("found 3"));
        assert!(err.is_version_conflict());
    }

    #[test]
    fn test_conflict_exhausted_is_user_facing() {
        let err = ConsistencyError::ConflictExhausted {
            key: key("P1"),
            attempts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("modified concurrently, retry the operation"));
        assert!(msg.contains('5'));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_only_conflict_exhausted_is_retriable() {
        assert!(!ConsistencyError::NotFound { key: key("a") }.is_retriable());
        assert!(!ConsistencyError::Store(StoreError::LockPoisoned).is_retriable());
    }

    #[test]
    fn test_store_error_conversion_lifts_terminal_variants() {
        let not_found = ConsistencyError::from(StoreError::NotFound { key: key("a") });
        assert!(matches!(not_found, ConsistencyError::NotFound { .. }));

        let exists = ConsistencyError::from(StoreError::AlreadyExists { key: key("a") });
        assert!(matches!(exists, ConsistencyError::AlreadyExists { .. }));

        let backend = ConsistencyError::from(StoreError::Backend {
            reason: "disk full".to_string(),
        });
        assert!(matches!(backend, ConsistencyError::Store(StoreError::Backend { .. })));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "retry.maxAttempts".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("retry.maxAttempts"));
        assert!(msg.contains("must be at least 1"));
    }
}
