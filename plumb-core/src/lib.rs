//! PLUMB Core - Data Types
//!
//! Pure data structures shared by every PLUMB crate: record identity and
//! versioning, invalidation events, the cache mode policy, configuration and
//! the error taxonomy. This crate performs no I/O.

use chrono::{DateTime, Utc};

pub mod config;
pub mod error;
pub mod event;
pub mod mode;
pub mod record;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{
    AuditSettings, BusSettings, CacheSettings, MetricsSettings, PlumbConfig, RetryPolicy,
};
pub use error::{
    BusError, BusResult, CacheError, CacheResult, ConfigError, ConsistencyError, PlumbResult,
    StoreError, StoreResult,
};
pub use event::{InvalidationCause, InvalidationEvent};
pub use mode::{CacheMode, CacheModeSwitch};
pub use record::{InvalidRecordKey, Record, RecordData, RecordKey, Version};
