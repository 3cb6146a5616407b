//! Metrics Flusher Background Task
//!
//! Appends one JSON object per metric sample to a file at a fixed interval:
//!
//! ```text
//! {"timestamp":"2024-05-01T12:00:05.000Z","service":"catalog","metric":"cache_hits","labels":{},"value":42.0}
//! {"timestamp":"2024-05-01T12:00:05.000Z","service":"catalog","metric":"read_latency_seconds","labels":{"statistic":"count"},"value":42.0}
//! ```
//!
//! The file is opened once in append mode and owned by the task. A final
//! flush runs on shutdown so the last interval is not lost.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use plumb_core::config::{DEFAULT_METRICS_FLUSH_INTERVAL_SECS, DEFAULT_METRICS_SERVICE};
use plumb_core::{ConfigError, MetricsSettings};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::EngineBuildError;
use crate::metrics::EngineMetrics;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the metrics flusher.
#[derive(Debug, Clone)]
pub struct MetricsFlusherConfig {
    /// File the samples are appended to. Parent directories are created.
    pub path: PathBuf,

    /// Time between flushes (default: 5 seconds)
    pub flush_interval: Duration,

    /// Value of the `service` field on every line
    pub service: String,
}

impl MetricsFlusherConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_interval: Duration::from_secs(DEFAULT_METRICS_FLUSH_INTERVAL_SECS),
            service: DEFAULT_METRICS_SERVICE.to_string(),
        }
    }

    /// Build from loaded settings. `None` when no path is configured, which
    /// disables the flusher.
    pub fn from_settings(settings: &MetricsSettings) -> Option<Self> {
        settings.path.as_ref().map(|path| Self {
            path: path.clone(),
            flush_interval: settings.flush_interval,
            service: settings.service.clone(),
        })
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for flusher activity.
#[derive(Debug, Default)]
pub struct MetricsFlusherStats {
    /// Completed flush cycles
    pub flushes: AtomicU64,

    /// JSON lines written since startup
    pub lines_written: AtomicU64,

    /// Flush cycles that failed to write
    pub write_errors: AtomicU64,
}

impl MetricsFlusherStats {
    pub fn snapshot(&self) -> MetricsFlusherSnapshot {
        MetricsFlusherSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            lines_written: self.lines_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsFlusherSnapshot {
    pub flushes: u64,
    pub lines_written: u64,
    pub write_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

#[derive(Serialize)]
struct MetricLine<'a> {
    timestamp: &'a str,
    service: &'a str,
    metric: &'a str,
    labels: &'a BTreeMap<String, String>,
    value: f64,
}

/// Entry point for the flusher task.
pub struct MetricsFlusher;

impl MetricsFlusher {
    /// Open the output file and spawn the flush loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush interval is zero, the directory cannot be
    /// created or the file cannot be opened for appending.
    pub async fn start(
        metrics: Arc<EngineMetrics>,
        config: MetricsFlusherConfig,
    ) -> Result<MetricsFlusherHandle, EngineBuildError> {
        if config.flush_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "metrics.flushIntervalSecs".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await?;

        let stats = Arc::new(MetricsFlusherStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            path = %config.path.display(),
            flush_interval_secs = config.flush_interval.as_secs_f64(),
            service = %config.service,
            "Metrics flusher started"
        );

        let task = tokio::spawn(flush_loop(
            metrics,
            config,
            file,
            Arc::clone(&stats),
            shutdown_rx,
        ));

        Ok(MetricsFlusherHandle {
            shutdown_tx,
            task,
            stats,
        })
    }
}

async fn flush_loop(
    metrics: Arc<EngineMetrics>,
    config: MetricsFlusherConfig,
    mut file: File,
    stats: Arc<MetricsFlusherStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // First flush one full interval after start.
    let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                flush_once(&metrics, &config, &mut file, &stats).await;
            }
        }
    }

    flush_once(&metrics, &config, &mut file, &stats).await;

    let snapshot = stats.snapshot();
    tracing::info!(
        flushes = snapshot.flushes,
        lines_written = snapshot.lines_written,
        write_errors = snapshot.write_errors,
        "Metrics flusher stopped"
    );
}

/// Render every sample as a JSON line and append them in one write.
async fn flush_once(
    metrics: &EngineMetrics,
    config: &MetricsFlusherConfig,
    file: &mut File,
    stats: &MetricsFlusherStats,
) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let samples = metrics.samples();

    let mut buffer = Vec::with_capacity(samples.len() * 128);
    let mut lines = 0u64;
    for sample in &samples {
        let line = MetricLine {
            timestamp: &timestamp,
            service: &config.service,
            metric: &sample.metric,
            labels: &sample.labels,
            value: sample.value,
        };
        match serde_json::to_writer(&mut buffer, &line) {
            Ok(()) => {
                buffer.push(b'\n');
                lines += 1;
            }
            Err(e) => {
                tracing::warn!(metric = %sample.metric, error = %e, "Failed to encode metric sample");
            }
        }
    }

    let written = match file.write_all(&buffer).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };

    match written {
        Ok(()) => {
            stats.flushes.fetch_add(1, Ordering::Relaxed);
            stats.lines_written.fetch_add(lines, Ordering::Relaxed);
            tracing::trace!(lines, "Metrics flushed");
        }
        Err(e) => {
            stats.write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(path = %config.path.display(), error = %e, "Failed to write metrics");
        }
    }
}

/// Handle to the running flusher.
pub struct MetricsFlusherHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<MetricsFlusherStats>,
}

impl MetricsFlusherHandle {
    pub fn stats(&self) -> MetricsFlusherSnapshot {
        self.stats.snapshot()
    }

    /// Stop the task after a final flush and return its statistics.
    pub async fn stop(self) -> MetricsFlusherSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Metrics flusher task failed");
        }
        self.stats.snapshot()
    }
}
