//! PLUMB Engine - Read-Through Cache Consistency
//!
//! Keeps a read-through cache consistent with a versioned record store:
//!
//! - [`ConsistencyEngine::read`]: cache-aside read, no negative caching
//! - [`ConsistencyEngine::write`]: optimistic-lock retry loop, then an
//!   invalidation event on the bus
//! - [`InvalidationConsumer`]: evicts keys named by invalidation events and
//!   measures the inconsistency window
//! - [`EngineMetrics`]: Prometheus counters and histograms, flushed to JSON
//!   lines by [`jobs::MetricsFlusher`]
//!
//! # Example
//!
//! ```ignore
//! let engine = ConsistencyEngine::builder(store, cache, bus)
//!     .with_config(PlumbConfig::from_env()?)
//!     .build()?;
//! let consumer = engine.invalidation_consumer().spawn().await?;
//!
//! engine.write(&key, |product| product.price = 12).await?;
//! let record = engine.read(&key).await?;
//!
//! let stats = consumer.shutdown().await;
//! ```

pub mod consumer;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod telemetry;

pub use consumer::{
    ConsumerHandle, ConsumerStats, ConsumerStatsSnapshot, EventOutcome, InvalidationConsumer,
};
pub use engine::{ConsistencyEngine, EngineBuilder};
pub use error::{EngineBuildError, TelemetryError};
pub use jobs::{MetricsFlusher, MetricsFlusherConfig, MetricsFlusherHandle};
pub use metrics::{EngineMetrics, HistogramSummary, MetricSample, MetricsError, MetricsSnapshot};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
