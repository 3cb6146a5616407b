//! PLUMB Test Utilities
//!
//! Shared test infrastructure for the PLUMB workspace:
//! - A `Product` payload used across scenarios
//! - Proptest generators for keys, versions, events and configs
//! - Fault-injecting store and cache adapters
//! - A [`TestHarness`] wiring an engine to in-memory collaborators
//! - Custom assertions for engine results

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use plumb_core::{
    BusError, CacheError, CacheMode, CacheModeSwitch, ConsistencyError, InvalidationCause,
    InvalidationEvent, PlumbConfig, PlumbResult, Record, RecordData, RecordKey, StoreError,
    StoreResult, Timestamp, Version,
};
pub use plumb_engine::{ConsistencyEngine, ConsumerHandle, EngineMetrics, InvalidationConsumer};
pub use plumb_events::{EventBus, InMemoryEventBus};
pub use plumb_storage::{
    CacheStats, CacheStore, CachedRecord, InMemoryCacheStore, InMemoryRecordStore, RecordStore,
};

use plumb_core::CacheResult;

/// Catalog item used as the record payload in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub price: u64,
    pub stock: u32,
}

impl Product {
    pub fn new(name: impl Into<String>, price: u64, stock: u32) -> Self {
        Self {
            name: name.into(),
            price,
            stock,
        }
    }
}

/// Build a record key, panicking on invalid input.
#[track_caller]
pub fn key(raw: &str) -> RecordKey {
    match RecordKey::new(raw) {
        Ok(key) => key,
        Err(e) => panic!("invalid test key: {e}"),
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for PLUMB types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    pub fn arb_record_key() -> impl Strategy<Value = RecordKey> {
        "[A-Za-z0-9_:.-]{1,32}".prop_map(|raw| key(&raw))
    }

    pub fn arb_version() -> impl Strategy<Value = Version> {
        (1u64..1_000_000).prop_map(Version::new)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-01-01 .. 2030-01-01, whole milliseconds
        (1_577_836_800_000i64..1_893_456_000_000i64).prop_map(|ms| {
            Utc.timestamp_millis_opt(ms)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_cause() -> impl Strategy<Value = InvalidationCause> {
        prop_oneof![
            Just(InvalidationCause::Update),
            Just(InvalidationCause::DerivedUpdate),
            Just(InvalidationCause::Create),
            Just(InvalidationCause::Delete),
        ]
    }

    pub fn arb_cache_mode() -> impl Strategy<Value = CacheMode> {
        prop_oneof![
            Just(CacheMode::None),
            Just(CacheMode::TtlOnly),
            Just(CacheMode::TtlInvalidate),
        ]
    }

    pub fn arb_product() -> impl Strategy<Value = Product> {
        ("[a-z ]{1,24}", 0u64..100_000, 0u32..1_000)
            .prop_map(|(name, price, stock)| Product::new(name, price, stock))
    }

    pub fn arb_event() -> impl Strategy<Value = InvalidationEvent> {
        (
            "[a-z]{1,12}",
            prop::collection::vec(arb_record_key(), 1..8),
            arb_version(),
            arb_cause(),
            arb_timestamp(),
        )
            .prop_map(|(namespace, keys, version, cause, ts)| {
                InvalidationEvent::with_timestamp(namespace, keys, version, cause, ts)
            })
    }

    /// Configs that pass `validate()`.
    pub fn arb_valid_config() -> impl Strategy<Value = PlumbConfig> {
        (
            arb_cache_mode(),
            1u64..3_600,
            1u32..10,
            0u64..500,
            0.0f64..=1.0,
        )
            .prop_map(|(mode, ttl_secs, attempts, backoff_ms, rate)| {
                PlumbConfig::default()
                    .with_mode(mode)
                    .with_ttl(Duration::from_secs(ttl_secs))
                    .with_retry(attempts, Duration::from_millis(backoff_ms))
                    .with_stale_read_sample_rate(rate)
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    /// Default config with a millisecond backoff so retry tests stay fast.
    pub fn fast_config() -> PlumbConfig {
        PlumbConfig::default()
            .with_namespace("product")
            .with_retry(5, Duration::from_millis(1))
    }

    /// The `P1` product from the price-update walkthrough.
    pub fn p1() -> (RecordKey, Product) {
        (key("P1"), Product::new("Widget", 10, 5))
    }

    pub fn product_record(raw_key: &str, version: u64, price: u64) -> Record<Product> {
        Record::new(
            key(raw_key),
            Version::new(version),
            Product::new("Widget", price, 5),
            chrono::Utc::now(),
        )
    }
}

// ============================================================================
// FAULT-INJECTING ADAPTERS
// ============================================================================

/// Cache wrapper that fails every operation while marked unavailable.
pub struct FlakyCacheStore<T: RecordData> {
    inner: InMemoryCacheStore<T>,
    available: Arc<AtomicBool>,
}

impl<T: RecordData> Clone for FlakyCacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            available: Arc::clone(&self.available),
        }
    }
}

impl<T: RecordData> FlakyCacheStore<T> {
    pub fn new(inner: InMemoryCacheStore<T>) -> Self {
        Self {
            inner,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn inner(&self) -> &InMemoryCacheStore<T> {
        &self.inner
    }

    fn check(&self) -> CacheResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                reason: "injected outage".to_string(),
            })
        }
    }
}

#[async_trait]
impl<T: RecordData> CacheStore<T> for FlakyCacheStore<T> {
    async fn get(&self, key: &RecordKey) -> CacheResult<Option<CachedRecord<T>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, record: &Record<T>) -> CacheResult<()> {
        self.check()?;
        self.inner.put(record).await
    }

    async fn evict(&self, key: &RecordKey) -> CacheResult<bool> {
        self.check()?;
        self.inner.evict(key).await
    }

    async fn clear(&self) -> CacheResult<u64> {
        self.check()?;
        self.inner.clear().await
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}

/// Record store wrapper that injects version conflicts and backend errors.
///
/// Each injected conflict is reported as if another writer had bumped the
/// version once; the underlying record is left untouched.
pub struct FaultyRecordStore<T: RecordData> {
    inner: InMemoryRecordStore<T>,
    forced_conflicts: Arc<AtomicU32>,
    fail_saves: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    read_delay_ms: Arc<AtomicU64>,
    save_calls: Arc<AtomicU64>,
    get_calls: Arc<AtomicU64>,
}

impl<T: RecordData> Clone for FaultyRecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            forced_conflicts: Arc::clone(&self.forced_conflicts),
            fail_saves: Arc::clone(&self.fail_saves),
            fail_reads: Arc::clone(&self.fail_reads),
            read_delay_ms: Arc::clone(&self.read_delay_ms),
            save_calls: Arc::clone(&self.save_calls),
            get_calls: Arc::clone(&self.get_calls),
        }
    }
}

impl<T: RecordData> FaultyRecordStore<T> {
    pub fn new(inner: InMemoryRecordStore<T>) -> Self {
        Self {
            inner,
            forced_conflicts: Arc::new(AtomicU32::new(0)),
            fail_saves: Arc::new(AtomicBool::new(false)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            read_delay_ms: Arc::new(AtomicU64::new(0)),
            save_calls: Arc::new(AtomicU64::new(0)),
            get_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make the next `n` saves or deletes fail with a version conflict.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::Release);
    }

    /// Make saves and deletes fail with a backend error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    /// Make reads fail with a backend error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Make every `get` sleep for `delay` before answering.
    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of `save` and `delete` calls, including failed ones.
    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::Acquire)
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Acquire)
    }

    pub fn inner(&self) -> &InMemoryRecordStore<T> {
        &self.inner
    }

    fn take_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn before_mutation(&self, key: &RecordKey, expected: Version) -> StoreResult<()> {
        self.save_calls.fetch_add(1, Ordering::AcqRel);
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(StoreError::Backend {
                reason: "injected write failure".to_string(),
            });
        }
        if self.take_conflict() {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected,
                actual: expected.next().unwrap_or(expected),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<T: RecordData> RecordStore<T> for FaultyRecordStore<T> {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Record<T>>> {
        self.get_calls.fetch_add(1, Ordering::AcqRel);
        let delay_ms = self.read_delay_ms.load(Ordering::Acquire);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(StoreError::Backend {
                reason: "injected read failure".to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn insert(&self, key: &RecordKey, data: T) -> StoreResult<Record<T>> {
        self.inner.insert(key, data).await
    }

    async fn save(&self, record: Record<T>, expected: Version) -> StoreResult<Record<T>> {
        self.before_mutation(&record.key, expected)?;
        self.inner.save(record, expected).await
    }

    async fn delete(&self, key: &RecordKey, expected: Version) -> StoreResult<()> {
        self.before_mutation(key, expected)?;
        self.inner.delete(key, expected).await
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// An engine wired to in-memory collaborators, with handles kept for
/// inspection and fault injection.
pub struct TestHarness {
    pub engine: ConsistencyEngine<Product>,
    pub store: FaultyRecordStore<Product>,
    pub cache: FlakyCacheStore<Product>,
    pub bus: InMemoryEventBus,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fixtures::fast_config())
    }

    pub fn with_config(config: PlumbConfig) -> Self {
        let store = FaultyRecordStore::new(InMemoryRecordStore::new());
        let bus = InMemoryEventBus::new(2);
        Self::sharing(config, store, bus)
    }

    /// A harness over an existing store and bus with its own fresh cache, as
    /// a second service instance would be.
    pub fn sharing(
        config: PlumbConfig,
        store: FaultyRecordStore<Product>,
        bus: InMemoryEventBus,
    ) -> Self {
        let cache = FlakyCacheStore::new(InMemoryCacheStore::new(config.cache.ttl));
        let engine = match ConsistencyEngine::builder(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            Arc::new(bus.clone()),
        )
        .with_config(config)
        .build()
        {
            Ok(engine) => engine,
            Err(e) => panic!("test engine failed to build: {e}"),
        };
        Self {
            engine,
            store,
            cache,
            bus,
        }
    }

    /// Seed a product directly in the store, bypassing the engine.
    pub async fn seed(&self, raw_key: &str, product: Product) -> Record<Product> {
        match self.store.inner().insert(&key(raw_key), product).await {
            Ok(record) => record,
            Err(e) => panic!("seed failed: {e}"),
        }
    }

    pub async fn start_consumer(&self) -> ConsumerHandle {
        match self.engine.invalidation_consumer().spawn().await {
            Ok(handle) => handle,
            Err(e) => panic!("consumer failed to start: {e}"),
        }
    }

    pub fn topic(&self) -> &str {
        &self.engine.config().bus.topic
    }

    pub fn group(&self) -> &str {
        &self.engine.config().bus.consumer_group
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the consumer behind `handle` has received at least `n`
/// messages. Panics after two seconds.
pub async fn wait_for_messages(handle: &ConsumerHandle, n: u64) {
    let reached = wait_until(Duration::from_secs(2), || {
        handle.stats().messages_received >= n
    })
    .await;
    assert!(
        reached,
        "consumer received {} of {} messages",
        handle.stats().messages_received,
        n
    );
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for engine results.

    use super::*;

    #[track_caller]
    pub fn assert_conflict_exhausted<T: std::fmt::Debug>(
        result: &PlumbResult<T>,
        expected_attempts: u32,
    ) {
        match result {
            Err(ConsistencyError::ConflictExhausted { attempts, .. }) => {
                assert_eq!(*attempts, expected_attempts, "Wrong attempt count");
            }
            other => panic!("Expected ConflictExhausted, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &PlumbResult<T>) {
        match result {
            Err(ConsistencyError::NotFound { .. }) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &PlumbResult<T>) {
        match result {
            Err(ConsistencyError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_version(record: &Record<Product>, expected: u64) {
        assert_eq!(
            record.version,
            Version::new(expected),
            "Version mismatch for {}",
            record.key
        );
    }
}
