//! Prometheus metrics for the consistency engine.
//!
//! Every [`EngineMetrics`] owns its own [`Registry`], so several engines in
//! one process (or one test binary) never collide on metric names.

use std::collections::BTreeMap;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use thiserror::Error;

/// Latency buckets for cache and store operations (seconds).
/// Covers: 0.1ms to 2.5s.
const OPERATION_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5,
];

/// Inconsistency window buckets (seconds).
/// Covers: 1ms to 60s; consumer lag can be large when a consumer restarts.
const WINDOW_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register {name}: {reason}")]
    Register { name: &'static str, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Container for all engine metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,

    /// Reads served from a live cache entry
    pub cache_hits: IntCounter,
    /// Reads that fell through to the store while the cache was in use
    pub cache_misses: IntCounter,
    /// Reads served straight from the store because caching is off
    pub cache_bypass: IntCounter,
    /// Sampled cache hits whose version differed from the store
    pub stale_reads_detected: IntCounter,
    pub invalidations_sent: IntCounter,
    pub invalidations_received: IntCounter,
    pub invalidation_publish_failures: IntCounter,
    pub invalidation_decode_failures: IntCounter,
    /// Optimistic-lock rejections, counted per attempt
    pub write_conflicts: IntCounter,
    pub writes_committed: IntCounter,

    pub read_latency_seconds: Histogram,
    pub write_latency_seconds: Histogram,
    /// Delay between event creation and its consumption
    pub inconsistency_window_seconds: Histogram,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn counter(registry: &Registry, name: &'static str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::with_opts(Opts::new(name, help)).map_err(|e| {
        MetricsError::Register {
            name,
            reason: e.to_string(),
        }
    })?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| MetricsError::Register {
            name,
            reason: e.to_string(),
        })?;
    Ok(counter)
}

fn histogram(
    registry: &Registry,
    name: &'static str,
    help: &str,
    buckets: &[f64],
) -> Result<Histogram, MetricsError> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets.to_vec()))
        .map_err(|e| MetricsError::Register {
            name,
            reason: e.to_string(),
        })?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| MetricsError::Register {
            name,
            reason: e.to_string(),
        })?;
    Ok(histogram)
}

impl EngineMetrics {
    /// Create all metrics in a fresh registry whose names carry the `plumb_` prefix.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("plumb".to_string()), None).map_err(|e| {
            MetricsError::Register {
                name: "registry",
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            cache_hits: counter(&registry, "cache_hits", "Reads served from the cache")?,
            cache_misses: counter(&registry, "cache_misses", "Reads that missed the cache")?,
            cache_bypass: counter(
                &registry,
                "cache_bypass",
                "Reads served from the store with caching disabled",
            )?,
            stale_reads_detected: counter(
                &registry,
                "stale_reads_detected",
                "Sampled cache hits older than the stored version",
            )?,
            invalidations_sent: counter(
                &registry,
                "invalidations_sent",
                "Invalidation events published",
            )?,
            invalidations_received: counter(
                &registry,
                "invalidations_received",
                "Invalidation events consumed and applied",
            )?,
            invalidation_publish_failures: counter(
                &registry,
                "invalidation_publish_failures",
                "Invalidation events that could not be published",
            )?,
            invalidation_decode_failures: counter(
                &registry,
                "invalidation_decode_failures",
                "Bus payloads that did not decode as invalidation events",
            )?,
            write_conflicts: counter(
                &registry,
                "write_conflicts",
                "Optimistic-lock version conflicts",
            )?,
            writes_committed: counter(&registry, "writes_committed", "Committed store writes")?,
            read_latency_seconds: histogram(
                &registry,
                "read_latency_seconds",
                "Read latency in seconds",
                OPERATION_LATENCY_BUCKETS,
            )?,
            write_latency_seconds: histogram(
                &registry,
                "write_latency_seconds",
                "Write latency in seconds, retries included",
                OPERATION_LATENCY_BUCKETS,
            )?,
            inconsistency_window_seconds: histogram(
                &registry,
                "inconsistency_window_seconds",
                "Delay between invalidation event creation and consumption",
                WINDOW_BUCKETS,
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of every metric as plain numbers.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_bypass: self.cache_bypass.get(),
            stale_reads_detected: self.stale_reads_detected.get(),
            invalidations_sent: self.invalidations_sent.get(),
            invalidations_received: self.invalidations_received.get(),
            invalidation_publish_failures: self.invalidation_publish_failures.get(),
            invalidation_decode_failures: self.invalidation_decode_failures.get(),
            write_conflicts: self.write_conflicts.get(),
            writes_committed: self.writes_committed.get(),
            read_latency: HistogramSummary::of(&self.read_latency_seconds),
            write_latency: HistogramSummary::of(&self.write_latency_seconds),
            inconsistency_window: HistogramSummary::of(&self.inconsistency_window_seconds),
        }
    }

    /// Flatten every metric into individually labelled samples.
    ///
    /// Counters yield one sample; histograms yield a `count` and a `sum`
    /// sample distinguished by the `statistic` label.
    pub fn samples(&self) -> Vec<MetricSample> {
        let counters = [
            ("cache_hits", &self.cache_hits),
            ("cache_misses", &self.cache_misses),
            ("cache_bypass", &self.cache_bypass),
            ("stale_reads_detected", &self.stale_reads_detected),
            ("invalidations_sent", &self.invalidations_sent),
            ("invalidations_received", &self.invalidations_received),
            ("invalidation_publish_failures", &self.invalidation_publish_failures),
            ("invalidation_decode_failures", &self.invalidation_decode_failures),
            ("write_conflicts", &self.write_conflicts),
            ("writes_committed", &self.writes_committed),
        ];
        let histograms = [
            ("read_latency_seconds", &self.read_latency_seconds),
            ("write_latency_seconds", &self.write_latency_seconds),
            ("inconsistency_window_seconds", &self.inconsistency_window_seconds),
        ];

        let mut samples: Vec<MetricSample> = counters
            .into_iter()
            .map(|(name, c)| MetricSample::new(name, None, c.get() as f64))
            .collect();

        for (name, h) in histograms {
            samples.push(MetricSample::new(name, Some("count"), h.get_sample_count() as f64));
            samples.push(MetricSample::new(name, Some("sum"), h.get_sample_sum()));
        }
        samples
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

/// One labelled measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricSample {
    fn new(metric: &str, statistic: Option<&str>, value: f64) -> Self {
        let mut labels = BTreeMap::new();
        if let Some(statistic) = statistic {
            labels.insert("statistic".to_string(), statistic.to_string());
        }
        Self {
            metric: metric.to_string(),
            labels,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum_seconds: f64,
}

impl HistogramSummary {
    fn of(histogram: &Histogram) -> Self {
        Self {
            count: histogram.get_sample_count(),
            sum_seconds: histogram.get_sample_sum(),
        }
    }
}

/// Snapshot of engine metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bypass: u64,
    pub stale_reads_detected: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub invalidation_publish_failures: u64,
    pub invalidation_decode_failures: u64,
    pub write_conflicts: u64,
    pub writes_committed: u64,
    pub read_latency: HistogramSummary,
    pub write_latency: HistogramSummary,
    pub inconsistency_window: HistogramSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_isolated() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.cache_hits.inc();
        assert_eq!(a.snapshot().cache_hits, 1);
        assert_eq!(b.snapshot().cache_hits, 0);
    }

    #[test]
    fn test_encode_text_uses_prefix() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.writes_committed.inc();
        metrics.read_latency_seconds.observe(0.002);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("plumb_writes_committed 1"));
        assert!(text.contains("plumb_read_latency_seconds_count 1"));
    }

    #[test]
    fn test_samples_cover_counters_and_histograms() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.inconsistency_window_seconds.observe(0.5);

        let samples = metrics.samples();
        assert_eq!(samples.len(), 10 + 3 * 2);

        let window_sum = samples
            .iter()
            .find(|s| {
                s.metric == "inconsistency_window_seconds"
                    && s.labels.get("statistic").map(String::as_str) == Some("sum")
            })
            .unwrap();
        assert!((window_sum.value - 0.5).abs() < f64::EPSILON);
    }
}
