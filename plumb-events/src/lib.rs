//! PLUMB Events - Event Bus Adapter
//!
//! Topic-based publish/subscribe with at-least-once delivery and ordering
//! guaranteed only within a partition, plus the JSON codec for
//! [`plumb_core::InvalidationEvent`].
//!
//! ```text
//! publish(topic, partition_key, payload)
//!          │
//!          ▼
//! ┌──────────────────────────────┐
//! │ topic                         │
//! │  partition 0: [m0][m1][m2]    │──► group "cache-evictors" (shared offsets)
//! │  partition 1: [m0][m1]        │──► group "audit"          (own offsets)
//! └──────────────────────────────┘
//! ```

pub mod bus;
pub mod codec;
pub mod in_memory;

pub use bus::{BusMessage, Delivery, EventBus, EventStream};
pub use codec::{decode_event, encode_event};
pub use in_memory::InMemoryEventBus;
