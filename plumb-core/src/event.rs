//! Invalidation events exchanged over the bus.

use crate::{RecordKey, Timestamp, Version};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why an invalidation event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationCause {
    /// A direct mutation of the record.
    Update,
    /// The record changed because state it is derived from changed.
    DerivedUpdate,
    Create,
    Delete,
    /// Emitted by a producer this build does not know about. Still evicts.
    #[serde(other)]
    Unknown,
}

impl InvalidationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::DerivedUpdate => "derived-update",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InvalidationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable notice that cached copies of `keys` are stale as of `version`.
///
/// Wire shape:
/// `{"namespace": "...", "keys": ["..."], "version": 2, "timestamp": "<RFC3339>", "cause": "update"}`.
/// The legacy field names `ns` and `ts` are accepted when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    #[serde(alias = "ns")]
    namespace: String,
    keys: Vec<RecordKey>,
    version: Version,
    #[serde(alias = "ts")]
    timestamp: Timestamp,
    cause: InvalidationCause,
}

impl InvalidationEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        namespace: impl Into<String>,
        keys: Vec<RecordKey>,
        version: Version,
        cause: InvalidationCause,
    ) -> Self {
        Self::with_timestamp(namespace, keys, version, cause, Utc::now())
    }

    pub fn with_timestamp(
        namespace: impl Into<String>,
        keys: Vec<RecordKey>,
        version: Version,
        cause: InvalidationCause,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            keys,
            version,
            timestamp,
            cause,
        }
    }

    /// Convenience constructor for the single-key case every write produces.
    pub fn for_key(
        namespace: impl Into<String>,
        key: RecordKey,
        version: Version,
        cause: InvalidationCause,
    ) -> Self {
        Self::new(namespace, vec![key], version, cause)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn keys(&self) -> &[RecordKey] {
        &self.keys
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn cause(&self) -> InvalidationCause {
        self.cause
    }

    /// Elapsed time between creation and `now`, clamped at zero for clock skew.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(raw: &str) -> RecordKey {
        RecordKey::new(raw).unwrap()
    }

    #[test]
    fn test_wire_shape_field_names() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = InvalidationEvent::with_timestamp(
            "product",
            vec![key("P1")],
            Version::new(2),
            InvalidationCause::Update,
            ts,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["namespace"], "product");
        assert_eq!(json["keys"][0], "P1");
        assert_eq!(json["version"], 2);
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(json["cause"], "update");
    }

    #[test]
    fn test_legacy_field_names_accepted() {
        let raw = r#"{"ns":"product","keys":["P1"],"version":3,"ts":"2024-05-01T12:00:00Z","cause":"derived-update"}"#;
        let event: InvalidationEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.namespace(), "product");
        assert_eq!(event.version(), Version::new(3));
        assert_eq!(event.cause(), InvalidationCause::DerivedUpdate);
    }

    #[test]
    fn test_unrecognized_cause_decodes_as_unknown() {
        let raw = r#"{"namespace":"product","keys":["P1"],"version":3,"timestamp":"2024-05-01T12:00:00Z","cause":"rating_update"}"#;
        let event: InvalidationEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.cause(), InvalidationCause::Unknown);
    }

    #[test]
    fn test_empty_key_in_payload_rejected() {
        let raw = r#"{"namespace":"product","keys":[""],"version":3,"timestamp":"2024-05-01T12:00:00Z","cause":"update"}"#;
        assert!(serde_json::from_str::<InvalidationEvent>(raw).is_err());
    }

    #[test]
    fn test_age_is_clamped_for_future_timestamps() {
        let now = Utc::now();
        let event = InvalidationEvent::with_timestamp(
            "product",
            vec![key("P1")],
            Version::new(2),
            InvalidationCause::Update,
            now + chrono::Duration::seconds(5),
        );
        assert_eq!(event.age_at(now), Duration::ZERO);

        let older = InvalidationEvent::with_timestamp(
            "product",
            vec![key("P1")],
            Version::new(2),
            InvalidationCause::Update,
            now - chrono::Duration::milliseconds(250),
        );
        assert_eq!(older.age_at(now), Duration::from_millis(250));
    }
}
