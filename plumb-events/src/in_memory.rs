//! In-memory partitioned event bus.
//!
//! Each topic is split into a fixed number of partitions. A partition is an
//! append-only log that keeps the most recent `retention` messages. Consumer
//! groups track one next-offset per partition; members of the same group
//! claim messages from those shared offsets, so each message goes to one
//! member of each group.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use plumb_core::{BusError, BusResult};
use tokio::sync::watch;

use crate::bus::{BusMessage, Delivery, EventBus, EventStream};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 4;

/// Default number of messages retained per partition.
pub const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Default)]
struct PartitionLog {
    base_offset: u64,
    entries: VecDeque<BusMessage>,
}

impl PartitionLog {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.entries.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&BusMessage> {
        let index = offset.checked_sub(self.base_offset)?;
        self.entries.get(usize::try_from(index).ok()?)
    }
}

#[derive(Debug)]
struct GroupState {
    next_offsets: Vec<u64>,
    next_partition: usize,
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<PartitionLog>,
    groups: HashMap<String, GroupState>,
}

impl TopicState {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            groups: HashMap::new(),
        }
    }

    fn join(&mut self, group: &str) -> &mut GroupState {
        let partitions = &self.partitions;
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                next_offsets: partitions.iter().map(|p| p.base_offset).collect(),
                next_partition: 0,
            })
    }

    /// Claim the next undelivered message for `group`, rotating across
    /// partitions so one busy key cannot starve the others.
    fn claim(&mut self, topic: &str, group: &str) -> Option<BusMessage> {
        self.join(group);
        let count = self.partitions.len();
        let state = self.groups.get_mut(group)?;

        for step in 0..count {
            let index = (state.next_partition + step) % count;
            let log = &self.partitions[index];
            let mut next = state.next_offsets[index];
            if next < log.base_offset {
                tracing::warn!(
                    topic,
                    group,
                    partition = index,
                    skipped = log.base_offset - next,
                    "Consumer group fell behind retention, messages skipped"
                );
                next = log.base_offset;
            }
            if let Some(message) = log.get(next) {
                state.next_offsets[index] = next + 1;
                state.next_partition = (index + 1) % count;
                return Some(message.clone());
            }
            state.next_offsets[index] = next;
        }
        None
    }
}

struct Inner {
    partitions: u32,
    retention: usize,
    topics: Mutex<HashMap<String, TopicState>>,
    wakeup: watch::Sender<u64>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn with_topic<R>(&self, topic: &str, f: impl FnOnce(&mut TopicState) -> R) -> BusResult<R> {
        let mut topics = self.topics.lock().map_err(|_| BusError::Unavailable {
            reason: "bus state lock poisoned".to_string(),
        })?;
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.partitions));
        Ok(f(state))
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    fn notify(&self) {
        self.wakeup.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

/// Partitioned in-memory bus with consumer groups and a retained log.
///
/// Clones share the same topics. The availability switch makes `publish`
/// and `subscribe` fail with [`BusError::Unavailable`] while off; messages
/// already retained keep flowing to existing subscriptions.
///
/// # Example
///
/// ```ignore
/// let bus = InMemoryEventBus::new(4);
/// let mut stream = bus.subscribe("cache.invalidate", "cache-evictors").await?;
/// bus.publish("cache.invalidate", "P1", payload).await?;
/// let message = stream.next().await;
/// ```
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("partitions", &self.inner.partitions)
            .field("retention", &self.inner.retention)
            .field("available", &self.is_available())
            .finish()
    }
}

impl InMemoryEventBus {
    /// Create a bus with `partitions` partitions per topic (at least one).
    pub fn new(partitions: u32) -> Self {
        Self::with_retention(partitions, DEFAULT_RETENTION)
    }

    pub fn with_retention(partitions: u32, retention: usize) -> Self {
        let (wakeup, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                topics: Mutex::new(HashMap::new()),
                wakeup,
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Toggle availability for fault injection.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        self.inner.partition_for(key)
    }

    /// Every retained message on `topic`, ordered by partition then offset.
    pub fn retained(&self, topic: &str) -> BusResult<Vec<BusMessage>> {
        self.inner.with_topic(topic, |state| {
            state
                .partitions
                .iter()
                .flat_map(|log| log.entries.iter().cloned())
                .collect()
        })
    }

    /// Messages retained on `topic` that `group` has not claimed yet.
    ///
    /// A group that has never subscribed lags by the whole retained log.
    pub fn lag(&self, topic: &str, group: &str) -> BusResult<u64> {
        self.inner.with_topic(topic, |state| match state.groups.get(group) {
            Some(group) => state
                .partitions
                .iter()
                .zip(&group.next_offsets)
                .map(|(log, next)| log.end_offset().saturating_sub((*next).max(log.base_offset)))
                .sum(),
            None => state.partitions.iter().map(|log| log.entries.len() as u64).sum(),
        })
    }

    /// Move `group` back to the earliest retained offsets, as a consumer
    /// restarting from an old checkpoint would. Already-claimed messages are
    /// delivered again.
    pub fn rewind(&self, topic: &str, group: &str) -> BusResult<()> {
        self.inner.with_topic(topic, |state| {
            let earliest: Vec<u64> = state.partitions.iter().map(|p| p.base_offset).collect();
            let group = state.join(group);
            group.next_offsets = earliest;
            group.next_partition = 0;
        })?;
        self.inner.notify();
        Ok(())
    }

    /// End every open subscription stream and reject further calls.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify();
    }

    fn check_open(&self, topic: &str) -> BusResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed {
                topic: topic.to_string(),
            });
        }
        if !self.is_available() {
            return Err(BusError::Unavailable {
                reason: "bus marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

struct Subscription {
    inner: Arc<Inner>,
    wakeup: watch::Receiver<u64>,
    topic: String,
    group: String,
    done: bool,
}

impl Subscription {
    async fn next_message(mut self) -> Option<(BusResult<BusMessage>, Self)> {
        loop {
            if self.done || self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            // Mark the current sequence seen before claiming, so a publish
            // racing with an empty claim still wakes `changed()` below.
            self.wakeup.borrow_and_update();

            let (topic, group) = (self.topic.as_str(), self.group.as_str());
            match self.inner.with_topic(topic, |state| state.claim(topic, group)) {
                Ok(Some(message)) => return Some((Ok(message), self)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(topic, group, error = %e, "Subscription terminated");
                    self.done = true;
                    return Some((Err(e), self));
                }
            }

            if self.wakeup.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> BusResult<Delivery> {
        self.check_open(topic)?;

        let partition = self.inner.partition_for(partition_key);
        let retention = self.inner.retention;
        let delivery = self.inner.with_topic(topic, |state| {
            let log = &mut state.partitions[partition as usize];
            let offset = log.end_offset();
            log.entries.push_back(BusMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: partition_key.to_string(),
                payload,
                published_at: Utc::now(),
            });
            while log.entries.len() > retention {
                log.entries.pop_front();
                log.base_offset += 1;
            }
            Delivery { partition, offset }
        })?;

        self.inner.notify();
        tracing::trace!(
            topic,
            key = partition_key,
            partition = delivery.partition,
            offset = delivery.offset,
            "Message published"
        );
        Ok(delivery)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BusResult<EventStream> {
        self.check_open(topic)?;

        // Register the group now so messages published before the first poll
        // are not missed.
        self.inner.with_topic(topic, |state| {
            state.join(group);
        })?;

        let subscription = Subscription {
            inner: Arc::clone(&self.inner),
            wakeup: self.inner.wakeup.subscribe(),
            topic: topic.to_string(),
            group: group.to_string(),
            done: false,
        };
        tracing::debug!(topic, group, "Subscribed");

        Ok(stream::unfold(subscription, Subscription::next_message).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TOPIC: &str = "cache.invalidate";

    async fn next(stream: &mut EventStream) -> BusMessage {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("message should arrive")
            .expect("stream should be open")
            .expect("message should be ok")
    }

    async fn nothing_pending(stream: &mut EventStream) -> bool {
        timeout(Duration::from_millis(50), stream.next()).await.is_err()
    }

    #[tokio::test]
    async fn test_publish_then_subscribe_sees_retained_messages() {
        let bus = InMemoryEventBus::new(2);
        bus.publish(TOPIC, "P1", b"one".to_vec()).await.unwrap();

        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();
        let message = next(&mut stream).await;
        assert_eq!(message.payload, b"one".to_vec());
        assert_eq!(message.key, "P1");
    }

    #[tokio::test]
    async fn test_subscriber_woken_by_later_publish() {
        let bus = InMemoryEventBus::new(2);
        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(TOPIC, "P1", b"late".to_vec()).await.unwrap();
        });

        assert_eq!(next(&mut stream).await.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_same_key_preserves_order() {
        let bus = InMemoryEventBus::new(4);
        for i in 0..5u8 {
            bus.publish(TOPIC, "P1", vec![i]).await.unwrap();
        }
        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();
        for i in 0..5u8 {
            assert_eq!(next(&mut stream).await.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_distinct_groups_each_receive_every_message() {
        let bus = InMemoryEventBus::new(2);
        let mut a = bus.subscribe(TOPIC, "a").await.unwrap();
        let mut b = bus.subscribe(TOPIC, "b").await.unwrap();
        bus.publish(TOPIC, "P1", b"x".to_vec()).await.unwrap();

        assert_eq!(next(&mut a).await.payload, b"x".to_vec());
        assert_eq!(next(&mut b).await.payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_group_members_share_messages() {
        let bus = InMemoryEventBus::new(1);
        let mut first = bus.subscribe(TOPIC, "g").await.unwrap();
        let mut second = bus.subscribe(TOPIC, "g").await.unwrap();
        bus.publish(TOPIC, "P1", b"only".to_vec()).await.unwrap();

        assert_eq!(next(&mut first).await.payload, b"only".to_vec());
        assert!(nothing_pending(&mut second).await);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let bus = InMemoryEventBus::with_retention(1, 2);
        for i in 0..4u8 {
            bus.publish(TOPIC, "P1", vec![i]).await.unwrap();
        }
        let retained = bus.retained(TOPIC).unwrap();
        assert_eq!(retained.len(), 2);
        assert_eq!(retained[0].offset, 2);

        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();
        assert_eq!(next(&mut stream).await.payload, vec![2]);
    }

    #[tokio::test]
    async fn test_unavailable_bus_rejects_publish() {
        let bus = InMemoryEventBus::default();
        bus.set_available(false);
        let err = bus.publish(TOPIC, "P1", vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::Unavailable { .. }));
        assert!(bus.subscribe(TOPIC, "g").await.is_err());

        bus.set_available(true);
        bus.publish(TOPIC, "P1", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let bus = InMemoryEventBus::new(1);
        bus.publish(TOPIC, "P1", b"x".to_vec()).await.unwrap();
        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();
        next(&mut stream).await;
        assert_eq!(bus.lag(TOPIC, "g").unwrap(), 0);

        bus.rewind(TOPIC, "g").unwrap();
        assert_eq!(bus.lag(TOPIC, "g").unwrap(), 1);
        assert_eq!(next(&mut stream).await.payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = InMemoryEventBus::default();
        let mut stream = bus.subscribe(TOPIC, "g").await.unwrap();
        bus.close();
        let ended = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(ended.is_none());
        assert!(matches!(
            bus.publish(TOPIC, "P1", vec![]).await,
            Err(BusError::Closed { .. })
        ));
    }

    #[test]
    fn test_partition_routing_is_stable() {
        let bus = InMemoryEventBus::new(8);
        assert_eq!(bus.partition_for("P1"), bus.partition_for("P1"));
        assert!(bus.partition_for("P2") < 8);
    }
}
