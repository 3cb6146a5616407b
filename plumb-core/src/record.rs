//! Record identity, versioning and the record envelope.

use crate::Timestamp;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Marker trait for business payloads carried by a [`Record`].
///
/// Blanket-implemented for every type that can be cloned, serialized and
/// shared across tasks.
pub trait RecordData: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> RecordData for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Rejected record key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid record key {raw:?}: {reason}")]
pub struct InvalidRecordKey {
    pub raw: String,
    pub reason: &'static str,
}

/// Opaque record identifier.
///
/// Keys are non-empty and contain no control characters, so they can be used
/// verbatim as cache keys, partition keys and log fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidRecordKey> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidRecordKey {
                raw,
                reason: "key must not be empty",
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(InvalidRecordKey {
                raw,
                reason: "key must not contain control characters",
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for RecordKey {
    type Error = InvalidRecordKey;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl TryFrom<&str> for RecordKey {
    type Error = InvalidRecordKey;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

impl AsRef<str> for RecordKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optimistic-concurrency version stamp.
///
/// The first persisted version of a record is [`Version::INITIAL`]. Only
/// record store implementations advance versions; the engine compares them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version a successful save produces, or `None` once the counter
    /// is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A versioned record as held by the store and snapshotted into the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub key: RecordKey,
    pub version: Version,
    pub data: T,
    pub updated_at: Timestamp,
}

impl<T> Record<T> {
    pub fn new(key: RecordKey, version: Version, data: T, updated_at: Timestamp) -> Self {
        Self {
            key,
            version,
            data,
            updated_at,
        }
    }

    /// Build the first version of a record.
    pub fn initial(key: RecordKey, data: T) -> Self {
        Self::new(key, Version::INITIAL, data, Utc::now())
    }

    /// Bump the last-updated timestamp. The version is left untouched.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Map the payload, keeping key, version and timestamp.
    pub fn map<U, F>(self, f: F) -> Record<U>
    where
        F: FnOnce(T) -> U,
    {
        Record {
            key: self.key,
            version: self.version,
            data: f(self.data),
            updated_at: self.updated_at,
        }
    }
}
