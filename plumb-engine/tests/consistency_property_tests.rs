//! Property-Based Tests for Cache Consistency
//!
//! **Property 1: Read-after-write**
//! Once the invalidation consumer has processed the event for a write, a read
//! through any engine sharing the bus returns the written version.
//!
//! **Property 2: Version monotonicity**
//! Sequential writes to one key produce versions 1, 2, 3, ... with no gaps.
//!
//! **Property 3: No lost update**
//! N concurrent increments with a retry budget of at least N end at N.
//!
//! **Property 4: Idempotent eviction**
//! Duplicate events and events for absent keys never fail.
//!
//! **Property 5: No negative caching**
//! A miss for an absent key does not hide a record created afterwards.
//!
//! **Property 6: Bounded staleness**
//! In `ttl-only` mode a cached value is never served past its TTL.

use std::time::Duration;

use plumb_core::{CacheMode, InvalidationCause, Version};
use plumb_events::decode_event;
use plumb_test_utils::{
    assertions::assert_version, fixtures, generators, key, wait_for_messages, CacheStore, Product,
    RecordStore, TestHarness,
};
use proptest::prelude::*;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

// ============================================================================
// SCENARIO: PRICE UPDATE
// ============================================================================

#[tokio::test]
async fn test_price_update_walkthrough() {
    let h = TestHarness::new();
    let (p1, product) = fixtures::p1();
    h.seed(p1.as_str(), product).await;
    let consumer = h.start_consumer().await;

    // Warm the cache with v1.
    let warm = h.engine.read(&p1).await.unwrap().unwrap();
    assert_version(&warm, 1);
    assert!(h.cache.inner().contains(&p1));

    let written = h.engine.write(&p1, |p| p.price = 12).await.unwrap();
    assert_version(&written, 2);
    assert_eq!(written.data.price, 12);

    let retained = h.bus.retained(h.topic()).unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].key, "P1");
    let event = decode_event(&retained[0].payload).unwrap();
    assert_eq!(event.keys(), &[p1.clone()]);
    assert_eq!(event.version(), Version::new(2));
    assert_eq!(event.cause(), InvalidationCause::Update);
    assert_eq!(event.namespace(), "product");

    wait_for_messages(&consumer, 1).await;
    assert!(!h.cache.inner().contains(&p1));

    let misses_before = h.engine.metrics().snapshot().cache_misses;
    let read = h.engine.read(&p1).await.unwrap().unwrap();
    assert_version(&read, 2);
    assert_eq!(read.data.price, 12);
    assert_eq!(h.engine.metrics().snapshot().cache_misses, misses_before + 1);
    assert!(h.cache.inner().contains(&p1));

    let stats = consumer.shutdown().await;
    assert_eq!(stats.events_applied, 1);
    let snapshot = h.engine.metrics().snapshot();
    assert_eq!(snapshot.invalidations_sent, 1);
    assert_eq!(snapshot.invalidations_received, 1);
    assert_eq!(snapshot.inconsistency_window.count, 1);
}

// ============================================================================
// READ-AFTER-WRITE ACROSS INSTANCES
// ============================================================================

#[tokio::test]
async fn test_remote_cache_is_invalidated() {
    let writer = TestHarness::new();
    let mut reader_config = fixtures::fast_config();
    reader_config.bus.consumer_group = "reader-evictors".to_string();
    let reader = TestHarness::sharing(reader_config, writer.store.clone(), writer.bus.clone());
    writer.seed("P1", Product::new("Widget", 10, 5)).await;

    let consumer = reader.start_consumer().await;
    let cached = reader.engine.read(&key("P1")).await.unwrap().unwrap();
    assert_version(&cached, 1);

    writer.engine.write(&key("P1"), |p| p.price = 15).await.unwrap();
    wait_for_messages(&consumer, 1).await;

    let fresh = reader.engine.read(&key("P1")).await.unwrap().unwrap();
    assert_version(&fresh, 2);
    assert_eq!(fresh.data.price, 15);
    consumer.shutdown().await;
}

// ============================================================================
// VERSION MONOTONICITY
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_sequential_writes_bump_version_by_one(
        product in generators::arb_product(),
        deltas in prop::collection::vec(1u64..100, 1..12),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let h = TestHarness::new();
            let k = key("P1");
            h.seed("P1", product.clone()).await;

            let mut expected_price = product.price;
            for (i, delta) in deltas.iter().enumerate() {
                let delta = *delta;
                let saved = h.engine.write(&k, |p| p.price += delta).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                expected_price += delta;
                prop_assert_eq!(saved.version, Version::new(i as u64 + 2));
                prop_assert_eq!(saved.data.price, expected_price);
            }

            let stored = h.store.get(&k).await.unwrap().unwrap();
            prop_assert_eq!(stored.version, Version::new(deltas.len() as u64 + 1));
            Ok(())
        })?;
    }
}

// ============================================================================
// NO LOST UPDATE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    const WRITERS: u32 = 16;

    let config = fixtures::fast_config().with_retry(WRITERS, Duration::from_millis(1));
    let h = TestHarness::with_config(config);
    h.seed("P1", Product::new("Widget", 10, 0)).await;

    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.write(&key("P1"), |p| p.stock += 1).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stored = h.store.get(&key("P1")).await.unwrap().unwrap();
    assert_eq!(stored.data.stock, WRITERS);
    assert_eq!(stored.version, Version::new(u64::from(WRITERS) + 1));
    assert_eq!(h.engine.metrics().snapshot().writes_committed, u64::from(WRITERS));
}

// ============================================================================
// IDEMPOTENT EVICTION
// ============================================================================

#[tokio::test]
async fn test_redelivered_events_are_harmless() {
    let h = TestHarness::new();
    h.seed("P1", Product::new("Widget", 10, 5)).await;
    let consumer = h.start_consumer().await;

    h.engine.write(&key("P1"), |p| p.price = 11).await.unwrap();
    h.engine.write(&key("P1"), |p| p.price = 12).await.unwrap();
    wait_for_messages(&consumer, 2).await;

    // Replay the whole log as a restarted consumer group would.
    h.bus.rewind(h.topic(), h.group()).unwrap();
    wait_for_messages(&consumer, 4).await;

    let stats = consumer.shutdown().await;
    assert_eq!(stats.events_applied, 4);
    assert_eq!(stats.eviction_failures, 0);

    let read = h.engine.read(&key("P1")).await.unwrap().unwrap();
    assert_version(&read, 3);
    assert_eq!(read.data.price, 12);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_events_for_absent_keys_apply_cleanly(
        keys in prop::collection::vec(generators::arb_record_key(), 1..8),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let h = TestHarness::new();
            let consumer = h.engine.invalidation_consumer();
            let event = plumb_core::InvalidationEvent::new(
                "product",
                keys.clone(),
                Version::new(7),
                InvalidationCause::Update,
            );

            for _ in 0..2 {
                let outcome = consumer.handle_event(&event).await;
                prop_assert_eq!(
                    outcome,
                    plumb_engine::EventOutcome::Applied { keys: keys.len(), evicted: 0 }
                );
            }
            prop_assert_eq!(consumer.stats().eviction_failures, 0);
            Ok(())
        })?;
    }
}

// ============================================================================
// NO NEGATIVE CACHING
// ============================================================================

#[tokio::test]
async fn test_miss_does_not_hide_later_create() {
    let h = TestHarness::new();
    let k = key("P9");

    assert!(h.engine.read(&k).await.unwrap().is_none());
    assert!(!h.cache.inner().contains(&k));

    let created = h.engine.create(&k, Product::new("Gadget", 20, 1)).await.unwrap();
    assert_version(&created, 1);

    let read = h.engine.read(&k).await.unwrap().unwrap();
    assert_eq!(read, created);
}

// ============================================================================
// BOUNDED STALENESS
// ============================================================================

#[tokio::test]
async fn test_ttl_only_bounds_staleness() {
    let config = fixtures::fast_config()
        .with_mode(CacheMode::TtlOnly)
        .with_ttl(Duration::from_millis(150));
    let reader = TestHarness::with_config(config.clone());
    let writer = TestHarness::sharing(config, reader.store.clone(), reader.bus.clone());
    reader.seed("P1", Product::new("Widget", 10, 5)).await;

    let cached = reader.engine.read(&key("P1")).await.unwrap().unwrap();
    assert_version(&cached, 1);

    writer.engine.write(&key("P1"), |p| p.price = 99).await.unwrap();
    assert!(writer.bus.retained(writer.topic()).unwrap().is_empty());

    // Within the TTL the reader may still serve v1.
    let maybe_stale = reader.engine.read(&key("P1")).await.unwrap().unwrap();
    assert!(maybe_stale.version <= Version::new(2));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let fresh = reader.engine.read(&key("P1")).await.unwrap().unwrap();
    assert_version(&fresh, 2);
    assert_eq!(fresh.data.price, 99);
    assert!(reader.cache.inner().stats().await.unwrap().expirations >= 1);
}

#[tokio::test]
async fn test_delete_invalidates_and_reads_none() {
    let h = TestHarness::new();
    h.seed("P1", Product::new("Widget", 10, 5)).await;
    let consumer = h.start_consumer().await;

    h.engine.read(&key("P1")).await.unwrap();
    let deleted = h.engine.delete(&key("P1")).await.unwrap();
    assert_version(&deleted, 1);

    wait_for_messages(&consumer, 1).await;
    consumer.shutdown().await;

    assert!(h.engine.read(&key("P1")).await.unwrap().is_none());
    let retained = h.bus.retained(h.topic()).unwrap();
    let event = decode_event(&retained[0].payload).unwrap();
    assert_eq!(event.cause(), InvalidationCause::Delete);
}
