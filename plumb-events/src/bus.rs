//! Event bus trait and message types.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use plumb_core::{BusResult, Timestamp};

/// Stream of messages delivered to one subscription.
///
/// Ends when the bus shuts down.
pub type EventStream = BoxStream<'static, BusResult<BusMessage>>;

/// Where a published message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
}

/// A message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    /// Partition key given at publish time.
    pub key: String,
    pub payload: Vec<u8>,
    pub published_at: Timestamp,
}

/// Topic-based publish/subscribe transport.
///
/// Messages sharing a partition key are delivered in publish order; there is
/// no ordering across keys. Delivery is at-least-once, so consumers must be
/// idempotent. Subscribers in the same `group` share the work of a topic;
/// every distinct group receives every message.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append `payload` to `topic`, routed by `partition_key`.
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> BusResult<Delivery>;

    /// Join consumer `group` on `topic`.
    ///
    /// A group seen for the first time starts from the earliest retained
    /// message.
    async fn subscribe(&self, topic: &str, group: &str) -> BusResult<EventStream>;
}
