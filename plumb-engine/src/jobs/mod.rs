//! Background jobs for the consistency engine.
//!
//! - `metrics_flusher`: periodically appends metric samples to a JSON lines file
//!
//! # Usage
//!
//! ```ignore
//! use plumb_engine::jobs::{MetricsFlusher, MetricsFlusherConfig};
//!
//! if let Some(config) = MetricsFlusherConfig::from_settings(&plumb_config.metrics) {
//!     let flusher = MetricsFlusher::start(Arc::clone(engine.metrics()), config).await?;
//!     // On shutdown
//!     let stats = flusher.stop().await;
//! }
//! ```

pub mod metrics_flusher;

pub use metrics_flusher::{
    MetricsFlusher, MetricsFlusherConfig, MetricsFlusherHandle, MetricsFlusherStats,
    MetricsFlusherSnapshot,
};
