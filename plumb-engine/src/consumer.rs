//! Invalidation consumer.
//!
//! Subscribes to the invalidation topic under a consumer group and evicts
//! every key named by each event. Eviction is unconditional and idempotent,
//! so duplicate or reordered deliveries are harmless and no dedup state is
//! kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use plumb_core::{BusSettings, CacheModeSwitch, InvalidationEvent, RecordData};
use plumb_events::{decode_event, EventBus, EventStream};
use plumb_storage::CacheStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::EngineBuildError;
use crate::metrics::EngineMetrics;

/// What the consumer did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Keys were evicted. `evicted` counts entries that were actually present.
    Applied { keys: usize, evicted: usize },
    /// Cache mode is not `ttl-invalidate`, or the event is for another namespace.
    Ignored,
    /// Payload did not decode.
    Malformed,
}

/// Counters for one consumer's lifetime.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub messages_received: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_ignored: AtomicU64,
    pub decode_failures: AtomicU64,
    pub keys_evicted: AtomicU64,
    pub eviction_failures: AtomicU64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            keys_evicted: self.keys_evicted.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub messages_received: u64,
    pub events_applied: u64,
    pub events_ignored: u64,
    pub decode_failures: u64,
    pub keys_evicted: u64,
    pub eviction_failures: u64,
}

/// Evicts cache entries named by invalidation events.
pub struct InvalidationConsumer<T: RecordData> {
    cache: Arc<dyn CacheStore<T>>,
    bus: Arc<dyn EventBus>,
    mode: Arc<CacheModeSwitch>,
    metrics: Arc<EngineMetrics>,
    topic: String,
    group: String,
    namespace: String,
    stats: Arc<ConsumerStats>,
}

impl<T: RecordData> Clone for InvalidationConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            bus: Arc::clone(&self.bus),
            mode: Arc::clone(&self.mode),
            metrics: Arc::clone(&self.metrics),
            topic: self.topic.clone(),
            group: self.group.clone(),
            namespace: self.namespace.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T: RecordData> InvalidationConsumer<T> {
    pub fn new(
        cache: Arc<dyn CacheStore<T>>,
        bus: Arc<dyn EventBus>,
        mode: Arc<CacheModeSwitch>,
        metrics: Arc<EngineMetrics>,
        settings: &BusSettings,
    ) -> Self {
        Self {
            cache,
            bus,
            mode,
            metrics,
            topic: settings.topic.clone(),
            group: settings.consumer_group.clone(),
            namespace: settings.namespace.clone(),
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Decode and apply one bus payload. Malformed payloads are logged,
    /// counted and skipped.
    pub async fn handle_payload(&self, payload: &[u8]) -> EventOutcome {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        match decode_event(payload) {
            Ok(event) => self.handle_event(&event).await,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.invalidation_decode_failures.inc();
                tracing::warn!(
                    topic = %self.topic,
                    payload_len = payload.len(),
                    error = %e,
                    "Skipping malformed invalidation payload"
                );
                EventOutcome::Malformed
            }
        }
    }

    /// Apply one decoded event.
    ///
    /// Every key is evicted regardless of the event's version; an eviction
    /// failure on one key does not stop the rest.
    pub async fn handle_event(&self, event: &InvalidationEvent) -> EventOutcome {
        let mode = self.mode.current();
        if !mode.invalidates() {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(mode = %mode, "Invalidation ignored in current cache mode");
            return EventOutcome::Ignored;
        }
        if event.namespace() != self.namespace {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                namespace = %event.namespace(),
                expected = %self.namespace,
                "Invalidation for another namespace ignored"
            );
            return EventOutcome::Ignored;
        }

        self.metrics.invalidations_received.inc();

        let mut evicted = 0;
        for key in event.keys() {
            match self.cache.evict(key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    self.stats.eviction_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, error = %e, "Eviction failed for invalidated key");
                }
            }
        }

        let window = event.age_at(Utc::now());
        self.metrics
            .inconsistency_window_seconds
            .observe(window.as_secs_f64());

        self.stats.events_applied.fetch_add(1, Ordering::Relaxed);
        self.stats
            .keys_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::debug!(
            keys = event.keys().len(),
            evicted,
            version = %event.version(),
            cause = %event.cause(),
            window_ms = window.as_millis() as u64,
            "Invalidation applied"
        );

        EventOutcome::Applied {
            keys: event.keys().len(),
            evicted,
        }
    }

    /// Subscribe and process messages on a background task until shut down.
    ///
    /// The subscription is established before this returns, so events
    /// published afterwards are guaranteed to reach this consumer group.
    pub async fn spawn(self) -> Result<ConsumerHandle, EngineBuildError> {
        let stream = self.bus.subscribe(&self.topic, &self.group).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);

        tracing::info!(
            topic = %self.topic,
            group = %self.group,
            namespace = %self.namespace,
            "Invalidation consumer started"
        );
        let task = tokio::spawn(self.run(stream, shutdown_rx));

        Ok(ConsumerHandle {
            shutdown_tx,
            task,
            stats,
        })
    }

    async fn run(self, mut stream: EventStream, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!(topic = %self.topic, "Invalidation consumer shutting down");
                        break;
                    }
                }

                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        self.handle_payload(&message.payload).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(topic = %self.topic, error = %e, "Bus delivery error");
                    }
                    None => {
                        tracing::info!(topic = %self.topic, "Subscription closed");
                        break;
                    }
                }
            }
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            messages_received = snapshot.messages_received,
            events_applied = snapshot.events_applied,
            events_ignored = snapshot.events_ignored,
            decode_failures = snapshot.decode_failures,
            keys_evicted = snapshot.keys_evicted,
            "Invalidation consumer stopped"
        );
    }
}

/// Handle to a running consumer task.
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    /// Live statistics while the task runs.
    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown, wait for the task to stop and return final statistics.
    pub async fn shutdown(self) -> ConsumerStatsSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Invalidation consumer task failed");
        }
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumb_core::{CacheMode, InvalidationCause, PlumbConfig, Record, RecordKey, Version};
    use plumb_events::{encode_event, InMemoryEventBus};
    use plumb_storage::InMemoryCacheStore;
    use std::time::Duration;

    fn key(raw: &str) -> RecordKey {
        RecordKey::new(raw).unwrap()
    }

    fn consumer(
        mode: CacheMode,
    ) -> (InvalidationConsumer<u32>, InMemoryCacheStore<u32>, InMemoryEventBus) {
        let cache = InMemoryCacheStore::new(Duration::from_secs(60));
        let bus = InMemoryEventBus::new(2);
        let config = PlumbConfig::default().with_namespace("product");
        let consumer = InvalidationConsumer::new(
            Arc::new(cache.clone()),
            Arc::new(bus.clone()),
            Arc::new(CacheModeSwitch::new(mode)),
            Arc::new(EngineMetrics::new().unwrap()),
            &config.bus,
        );
        (consumer, cache, bus)
    }

    fn event(keys: &[&str], version: u64) -> InvalidationEvent {
        InvalidationEvent::new(
            "product",
            keys.iter().map(|k| key(k)).collect(),
            Version::new(version),
            InvalidationCause::Update,
        )
    }

    #[tokio::test]
    async fn test_applies_event_and_evicts_every_key() {
        let (consumer, cache, _bus) = consumer(CacheMode::TtlInvalidate);
        cache.put(&Record::initial(key("P1"), 1)).await.unwrap();
        cache.put(&Record::initial(key("P2"), 2)).await.unwrap();

        let outcome = consumer.handle_event(&event(&["P1", "P2", "P3"], 2)).await;
        assert_eq!(outcome, EventOutcome::Applied { keys: 3, evicted: 2 });
        assert!(!cache.contains(&key("P1")));
        assert!(!cache.contains(&key("P2")));

        let metrics = consumer.metrics.snapshot();
        assert_eq!(metrics.invalidations_received, 1);
        assert_eq!(metrics.inconsistency_window.count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_harmless() {
        let (consumer, cache, _bus) = consumer(CacheMode::TtlInvalidate);
        cache.put(&Record::initial(key("P1"), 1)).await.unwrap();
        let e = event(&["P1"], 2);

        consumer.handle_event(&e).await;
        let second = consumer.handle_event(&e).await;
        assert_eq!(second, EventOutcome::Applied { keys: 1, evicted: 0 });
    }

    #[tokio::test]
    async fn test_older_version_still_evicts() {
        let (consumer, cache, _bus) = consumer(CacheMode::TtlInvalidate);
        let mut cached = Record::initial(key("P1"), 1);
        cached.version = Version::new(5);
        cache.put(&cached).await.unwrap();

        consumer.handle_event(&event(&["P1"], 3)).await;
        assert!(!cache.contains(&key("P1")));
    }

    #[tokio::test]
    async fn test_ignored_outside_ttl_invalidate() {
        let (consumer, cache, _bus) = consumer(CacheMode::TtlOnly);
        cache.put(&Record::initial(key("P1"), 1)).await.unwrap();

        assert_eq!(consumer.handle_event(&event(&["P1"], 2)).await, EventOutcome::Ignored);
        assert!(cache.contains(&key("P1")));
        assert_eq!(consumer.metrics.snapshot().invalidations_received, 0);
    }

    #[tokio::test]
    async fn test_foreign_namespace_ignored() {
        let (consumer, cache, _bus) = consumer(CacheMode::TtlInvalidate);
        cache.put(&Record::initial(key("P1"), 1)).await.unwrap();
        let foreign = InvalidationEvent::new(
            "review",
            vec![key("P1")],
            Version::new(2),
            InvalidationCause::Update,
        );

        assert_eq!(consumer.handle_event(&foreign).await, EventOutcome::Ignored);
        assert!(cache.contains(&key("P1")));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted() {
        let (consumer, _cache, _bus) = consumer(CacheMode::TtlInvalidate);
        assert_eq!(consumer.handle_payload(b"{oops").await, EventOutcome::Malformed);
        assert_eq!(consumer.stats().decode_failures, 1);
        assert_eq!(consumer.metrics.snapshot().invalidation_decode_failures, 1);
    }

    #[tokio::test]
    async fn test_spawned_consumer_processes_and_shuts_down() {
        let (consumer, cache, bus) = consumer(CacheMode::TtlInvalidate);
        cache.put(&Record::initial(key("P1"), 1)).await.unwrap();
        let handle = consumer.spawn().await.unwrap();

        let payload = encode_event(&event(&["P1"], 2)).unwrap();
        bus.publish("cache.invalidate", "P1", payload).await.unwrap();
        bus.publish("cache.invalidate", "P1", b"garbage".to_vec()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().messages_received < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer should drain both messages");

        let stats = handle.shutdown().await;
        assert_eq!(stats.events_applied, 1);
        assert_eq!(stats.decode_failures, 1);
        assert!(!cache.contains(&key("P1")));
    }
}
