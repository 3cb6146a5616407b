//! The consistency engine: cache-aside reads, optimistic-lock writes and
//! invalidation publishing.
//!
//! Reads check the cache and fall back to the store, populating the cache on
//! the way out. Writes evict the local entry, load, mutate and save against
//! the loaded version, retrying with linear backoff when another writer won
//! the race. A committed write publishes an [`InvalidationEvent`] so every
//! other cache holding the key drops it.

use std::sync::Arc;
use std::time::Instant;

use plumb_core::{
    CacheMode, CacheModeSwitch, ConsistencyError, InvalidationCause, InvalidationEvent,
    PlumbConfig, PlumbResult, Record, RecordData, RecordKey, StoreError, Version,
};
use plumb_events::{encode_event, EventBus};
use plumb_storage::{CacheStore, RecordStore};

use crate::consumer::InvalidationConsumer;
use crate::error::EngineBuildError;
use crate::metrics::EngineMetrics;

/// Builder for [`ConsistencyEngine`].
pub struct EngineBuilder<T: RecordData> {
    store: Arc<dyn RecordStore<T>>,
    cache: Arc<dyn CacheStore<T>>,
    bus: Arc<dyn EventBus>,
    config: PlumbConfig,
    mode: Option<Arc<CacheModeSwitch>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl<T: RecordData> EngineBuilder<T> {
    pub fn with_config(mut self, config: PlumbConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a mode switch with other components. Without one, the engine
    /// creates its own from `cache.mode`.
    pub fn with_mode_switch(mut self, mode: Arc<CacheModeSwitch>) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ConsistencyEngine<T>, EngineBuildError> {
        self.config.validate()?;

        let mode = self
            .mode
            .unwrap_or_else(|| Arc::new(CacheModeSwitch::new(self.config.cache.mode)));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(EngineMetrics::new()?),
        };

        tracing::info!(
            mode = %mode.current(),
            ttl_secs = self.config.cache.ttl.as_secs(),
            max_attempts = self.config.retry.max_attempts,
            base_backoff_ms = self.config.retry.base_backoff.as_millis() as u64,
            topic = %self.config.bus.topic,
            namespace = %self.config.bus.namespace,
            "Consistency engine configured"
        );

        Ok(ConsistencyEngine {
            store: self.store,
            cache: self.cache,
            bus: self.bus,
            mode,
            metrics,
            config: Arc::new(self.config),
        })
    }
}

/// Read-through cache consistency engine for records of type `T`.
///
/// Cheap to clone; clones share every collaborator. There is no in-process
/// per-key lock: concurrent writers are serialized by the record store's
/// compare-and-swap alone.
pub struct ConsistencyEngine<T: RecordData> {
    store: Arc<dyn RecordStore<T>>,
    cache: Arc<dyn CacheStore<T>>,
    bus: Arc<dyn EventBus>,
    mode: Arc<CacheModeSwitch>,
    metrics: Arc<EngineMetrics>,
    config: Arc<PlumbConfig>,
}

impl<T: RecordData> Clone for ConsistencyEngine<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            bus: Arc::clone(&self.bus),
            mode: Arc::clone(&self.mode),
            metrics: Arc::clone(&self.metrics),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: RecordData> ConsistencyEngine<T> {
    pub fn builder(
        store: Arc<dyn RecordStore<T>>,
        cache: Arc<dyn CacheStore<T>>,
        bus: Arc<dyn EventBus>,
    ) -> EngineBuilder<T> {
        EngineBuilder {
            store,
            cache,
            bus,
            config: PlumbConfig::default(),
            mode: None,
            metrics: None,
        }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &PlumbConfig {
        &self.config
    }

    pub fn mode(&self) -> CacheMode {
        self.mode.current()
    }

    pub fn mode_switch(&self) -> &Arc<CacheModeSwitch> {
        &self.mode
    }

    /// Switch the cache mode at runtime. Takes effect on the next call.
    pub fn set_mode(&self, mode: CacheMode) -> CacheMode {
        let previous = self.mode.set(mode);
        tracing::info!(previous = %previous, current = %mode, "Cache mode switched");
        previous
    }

    /// An invalidation consumer wired to this engine's cache, bus, mode
    /// switch and metrics.
    pub fn invalidation_consumer(&self) -> InvalidationConsumer<T> {
        InvalidationConsumer::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.bus),
            Arc::clone(&self.mode),
            Arc::clone(&self.metrics),
            &self.config.bus,
        )
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Read a record, serving it from the cache when possible.
    ///
    /// Returns `Ok(None)` when the key is absent from the store. Absence is
    /// never cached.
    pub async fn read(&self, key: &RecordKey) -> PlumbResult<Option<Record<T>>> {
        let started = Instant::now();
        let result = self.read_inner(key).await;
        self.metrics
            .read_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn read_inner(&self, key: &RecordKey) -> PlumbResult<Option<Record<T>>> {
        if !self.mode.current().uses_cache() {
            self.metrics.cache_bypass.inc();
            return Ok(self.store.get(key).await?);
        }

        match self.cache.get(key).await {
            Ok(Some(entry)) => {
                self.metrics.cache_hits.inc();
                let record = entry.into_record();
                self.spawn_audit(&record);
                return Ok(Some(record));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache lookup failed, reading from store");
            }
        }

        self.metrics.cache_misses.inc();
        let Some(record) = self.store.get(key).await? else {
            return Ok(None);
        };

        if let Err(e) = self.cache.put(&record).await {
            tracing::warn!(key = %key, error = %e, "Failed to populate cache");
        }
        Ok(Some(record))
    }

    /// Sampled comparison of a cache hit against the store. Runs on its own
    /// task so the hit returns without waiting on the store.
    fn spawn_audit(&self, cached: &Record<T>) {
        let rate = self.config.audit.stale_read_sample_rate;
        if rate <= 0.0 || (rate < 1.0 && rand::random::<f64>() >= rate) {
            return;
        }

        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let key = cached.key.clone();
        let cached_version = cached.version;
        tokio::spawn(async move {
            audit_cached_version(store, metrics, key, cached_version).await;
        });
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Apply `mutation` to the current record and save it, retrying on
    /// version conflicts. Publishes an `update` invalidation on success.
    pub async fn write<F>(&self, key: &RecordKey, mutation: F) -> PlumbResult<Record<T>>
    where
        F: FnMut(&mut T) + Send,
    {
        self.write_with_cause(key, InvalidationCause::Update, mutation)
            .await
    }

    /// Same as [`ConsistencyEngine::write`] with a caller-chosen cause, such
    /// as `derived-update` for a value recomputed from another collection.
    ///
    /// `mutation` runs once per attempt against freshly loaded data, so it
    /// must be safe to repeat.
    #[tracing::instrument(skip(self, mutation), fields(key = %key, cause = %cause))]
    pub async fn write_with_cause<F>(
        &self,
        key: &RecordKey,
        cause: InvalidationCause,
        mut mutation: F,
    ) -> PlumbResult<Record<T>>
    where
        F: FnMut(&mut T) + Send,
    {
        let started = Instant::now();
        let result = self.save_with_retry(key, &mut mutation).await;
        self.metrics
            .write_latency_seconds
            .observe(started.elapsed().as_secs_f64());

        let saved = result?;
        self.metrics.writes_committed.inc();
        tracing::debug!(version = %saved.version, "Write committed");
        self.publish_invalidation(key, saved.version, cause).await;
        Ok(saved)
    }

    async fn save_with_retry<F>(&self, key: &RecordKey, mutation: &mut F) -> PlumbResult<Record<T>>
    where
        F: FnMut(&mut T) + Send,
    {
        let policy = &self.config.retry;
        let mut attempt: u32 = 1;

        loop {
            self.evict_local(key).await;

            let mut record = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| ConsistencyError::NotFound { key: key.clone() })?;
            let expected = record.version;
            mutation(&mut record.data);
            record.touch();

            match self.store.save(record, expected).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict { actual, .. }) => {
                    self.on_conflict(key, attempt, expected, actual)?;
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Insert a new record at version 1.
    #[tracing::instrument(skip(self, data), fields(key = %key))]
    pub async fn create(&self, key: &RecordKey, data: T) -> PlumbResult<Record<T>> {
        let started = Instant::now();
        let result = self.store.insert(key, data).await;
        self.metrics
            .write_latency_seconds
            .observe(started.elapsed().as_secs_f64());

        let record = result?;
        self.metrics.writes_committed.inc();
        self.evict_local(key).await;
        self.publish_invalidation(key, record.version, InvalidationCause::Create)
            .await;
        Ok(record)
    }

    /// Delete a record with the same optimistic retry loop as writes.
    ///
    /// Returns the record as it was just before deletion.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &RecordKey) -> PlumbResult<Record<T>> {
        let started = Instant::now();
        let result = self.delete_with_retry(key).await;
        self.metrics
            .write_latency_seconds
            .observe(started.elapsed().as_secs_f64());

        let deleted = result?;
        self.metrics.writes_committed.inc();
        self.publish_invalidation(key, deleted.version, InvalidationCause::Delete)
            .await;
        Ok(deleted)
    }

    async fn delete_with_retry(&self, key: &RecordKey) -> PlumbResult<Record<T>> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 1;

        loop {
            self.evict_local(key).await;

            let record = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| ConsistencyError::NotFound { key: key.clone() })?;

            match self.store.delete(key, record.version).await {
                Ok(()) => return Ok(record),
                Err(StoreError::VersionConflict { actual, .. }) => {
                    self.on_conflict(key, attempt, record.version, actual)?;
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Count a conflict and decide whether another attempt is allowed.
    fn on_conflict(
        &self,
        key: &RecordKey,
        attempt: u32,
        expected: Version,
        actual: Version,
    ) -> PlumbResult<()> {
        self.metrics.write_conflicts.inc();
        let max_attempts = self.config.retry.max_attempts;

        if attempt >= max_attempts {
            tracing::warn!(
                key = %key,
                attempts = attempt,
                "Optimistic lock retries exhausted"
            );
            return Err(ConsistencyError::ConflictExhausted {
                key: key.clone(),
                attempts: attempt,
            });
        }

        tracing::debug!(
            key = %key,
            attempt,
            max_attempts,
            expected = %expected,
            actual = %actual,
            "Version conflict, retrying"
        );
        Ok(())
    }

    async fn evict_local(&self, key: &RecordKey) {
        if !self.mode.current().uses_cache() {
            return;
        }
        if let Err(e) = self.cache.evict(key).await {
            tracing::warn!(key = %key, error = %e, "Cache eviction failed");
        }
    }

    /// Publish an invalidation for a committed change. Failures are logged
    /// and counted, never returned: the store write already happened.
    async fn publish_invalidation(&self, key: &RecordKey, version: Version, cause: InvalidationCause) {
        if !self.mode.current().invalidates() {
            return;
        }

        let settings = &self.config.bus;
        let event = InvalidationEvent::for_key(settings.namespace.as_str(), key.clone(), version, cause);
        let payload = match encode_event(&event) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.invalidation_publish_failures.inc();
                tracing::warn!(key = %key, error = %e, "Failed to encode invalidation event");
                return;
            }
        };

        match self.bus.publish(&settings.topic, key.as_str(), payload).await {
            Ok(delivery) => {
                self.metrics.invalidations_sent.inc();
                tracing::debug!(
                    key = %key,
                    version = %version,
                    cause = %cause,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Invalidation published"
                );
            }
            Err(e) => {
                self.metrics.invalidation_publish_failures.inc();
                tracing::warn!(
                    key = %key,
                    version = %version,
                    error = %e,
                    "Failed to publish invalidation, remote caches fall back to TTL"
                );
            }
        }
    }
}

async fn audit_cached_version<T: RecordData>(
    store: Arc<dyn RecordStore<T>>,
    metrics: Arc<EngineMetrics>,
    key: RecordKey,
    cached_version: Version,
) {
    match store.get(&key).await {
        Ok(Some(current)) if current.version != cached_version => {
            metrics.stale_reads_detected.inc();
            tracing::warn!(
                key = %key,
                cached_version = %cached_version,
                store_version = %current.version,
                "Stale read detected"
            );
        }
        Ok(None) => {
            metrics.stale_reads_detected.inc();
            tracing::warn!(
                key = %key,
                cached_version = %cached_version,
                "Stale read detected, record no longer in store"
            );
        }
        Ok(Some(_)) => {}
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Stale read audit failed");
        }
    }
}
