//! Engine Tests Against Alternate Backends
//!
//! Runs the read and write paths over the LMDB record store and cache, over
//! the no-op cache, and with the metrics flusher attached.

use std::sync::Arc;
use std::time::Duration;

use plumb_core::{PlumbConfig, Version};
use plumb_engine::{ConsistencyEngine, MetricsFlusher, MetricsFlusherConfig};
use plumb_events::InMemoryEventBus;
use plumb_storage::{CacheStore, LmdbCacheStore, LmdbRecordStore, NoopCacheStore, RecordStore};
use plumb_test_utils::{fixtures, key, wait_for_messages, Product};
use tempfile::TempDir;

fn lmdb_engine(
    dir: &TempDir,
    config: PlumbConfig,
    bus: &InMemoryEventBus,
) -> (
    ConsistencyEngine<Product>,
    Arc<LmdbRecordStore<Product>>,
    Arc<LmdbCacheStore<Product>>,
) {
    let store = Arc::new(LmdbRecordStore::new(dir.path().join("records"), 16).unwrap());
    let cache = Arc::new(
        LmdbCacheStore::new(
            dir.path().join("cache"),
            16,
            config.bus.namespace.clone(),
            config.cache.ttl,
        )
        .unwrap(),
    );
    let engine = ConsistencyEngine::builder(
        Arc::clone(&store) as Arc<dyn RecordStore<Product>>,
        Arc::clone(&cache) as Arc<dyn CacheStore<Product>>,
        Arc::new(bus.clone()),
    )
    .with_config(config)
    .build()
    .unwrap();
    (engine, store, cache)
}

#[tokio::test]
async fn test_lmdb_backed_walkthrough() {
    let dir = TempDir::new().unwrap();
    let bus = InMemoryEventBus::new(2);
    let (engine, store, cache) = lmdb_engine(&dir, fixtures::fast_config(), &bus);
    let consumer = engine.invalidation_consumer().spawn().await.unwrap();

    let created = engine
        .create(&key("P1"), Product::new("Widget", 10, 5))
        .await
        .unwrap();
    assert_eq!(created.version, Version::INITIAL);
    wait_for_messages(&consumer, 1).await;

    engine.read(&key("P1")).await.unwrap();
    assert!(cache.get(&key("P1")).await.unwrap().is_some());

    let saved = engine.write(&key("P1"), |p| p.price = 12).await.unwrap();
    assert_eq!(saved.version, Version::new(2));
    wait_for_messages(&consumer, 2).await;
    assert!(cache.get(&key("P1")).await.unwrap().is_none());

    let read = engine.read(&key("P1")).await.unwrap().unwrap();
    assert_eq!(read.data.price, 12);
    assert_eq!(store.get(&key("P1")).await.unwrap().unwrap().version, Version::new(2));

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lmdb_concurrent_increments() {
    const WRITERS: u32 = 8;

    let dir = TempDir::new().unwrap();
    let bus = InMemoryEventBus::new(2);
    let config = fixtures::fast_config().with_retry(WRITERS, Duration::from_millis(1));
    let (engine, store, _cache) = lmdb_engine(&dir, config, &bus);
    engine
        .create(&key("P1"), Product::new("Widget", 10, 0))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.write(&key("P1"), |p| p.stock += 1).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stored = store.get(&key("P1")).await.unwrap().unwrap();
    assert_eq!(stored.data.stock, WRITERS);
}

#[tokio::test]
async fn test_noop_cache_always_reads_store() {
    let bus = InMemoryEventBus::new(1);
    let store = plumb_storage::InMemoryRecordStore::new();
    store
        .insert(&key("P1"), Product::new("Widget", 10, 5))
        .await
        .unwrap();

    let engine: ConsistencyEngine<Product> = ConsistencyEngine::builder(
        Arc::new(store.clone()),
        Arc::new(NoopCacheStore::new()),
        Arc::new(bus.clone()),
    )
    .with_config(fixtures::fast_config())
    .build()
    .unwrap();

    for _ in 0..3 {
        engine.read(&key("P1")).await.unwrap().unwrap();
    }
    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.cache_hits, 0);
    assert_eq!(snapshot.cache_misses, 3);
}

#[tokio::test]
async fn test_flusher_records_engine_activity() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metrics").join("plumb.jsonl");
    let bus = InMemoryEventBus::new(2);
    let (engine, _store, _cache) = lmdb_engine(&dir, fixtures::fast_config(), &bus);

    let flusher = MetricsFlusher::start(
        Arc::clone(engine.metrics()),
        MetricsFlusherConfig::new(&path)
            .with_flush_interval(Duration::from_millis(20))
            .with_service("catalog"),
    )
    .await
    .unwrap();

    engine
        .create(&key("P1"), Product::new("Widget", 10, 5))
        .await
        .unwrap();
    engine.read(&key("P1")).await.unwrap();
    engine.read(&key("P1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let stats = flusher.stop().await;
    assert!(stats.flushes >= 2);
    assert_eq!(stats.write_errors, 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    let last_hits = contents
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .filter(|line| line["metric"] == "cache_hits")
        .last()
        .unwrap();
    assert_eq!(last_hits["service"], "catalog");
    assert_eq!(last_hits["value"], 1.0);
}
