//! Configuration types
//!
//! Configuration is assembled from defaults, then optionally a TOML document
//! (`PlumbConfig::from_toml_str`) or `PLUMB_*` environment variables
//! (`PlumbConfig::from_env`). Call [`PlumbConfig::validate`] before use.

use crate::{CacheMode, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_BACKOFF_MS: u64 = 100;
pub const DEFAULT_STALE_READ_SAMPLE_RATE: f64 = 0.0;
pub const DEFAULT_TOPIC: &str = "cache.invalidate";
pub const DEFAULT_CONSUMER_GROUP: &str = "cache-evictors";
pub const DEFAULT_NAMESPACE: &str = "record";
pub const DEFAULT_METRICS_FLUSH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_METRICS_SERVICE: &str = "plumb";

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `cache.*` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSettings {
    pub mode: CacheMode,
    /// Entry time-to-live in seconds (`cache.ttl`, also read as `cache.ttlSecs`).
    #[serde(alias = "ttlSecs", with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

/// `retry.*` options for the optimistic write loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "baseBackoffMs", with = "duration_millis")]
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_RETRY_BASE_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Sleep before the attempt following `attempt` (1-based): base × attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }
}

/// `audit.*` options for the stale-read diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AuditSettings {
    /// Probability in `[0, 1]` that a cache hit is re-checked against the
    /// store. Zero disables auditing.
    pub stale_read_sample_rate: f64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            stale_read_sample_rate: DEFAULT_STALE_READ_SAMPLE_RATE,
        }
    }
}

impl AuditSettings {
    pub fn is_enabled(&self) -> bool {
        self.stale_read_sample_rate > 0.0
    }
}

/// `bus.*` options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BusSettings {
    pub topic: String,
    pub consumer_group: String,
    /// Namespace stamped on every published invalidation event.
    pub namespace: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// `metrics.*` options for the periodic metrics flusher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsSettings {
    /// JSON-lines sink. The flusher is disabled when unset.
    pub path: Option<PathBuf>,
    #[serde(rename = "flushIntervalSecs", with = "duration_secs")]
    pub flush_interval: Duration,
    pub service: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval: Duration::from_secs(DEFAULT_METRICS_FLUSH_INTERVAL_SECS),
            service: DEFAULT_METRICS_SERVICE.to_string(),
        }
    }
}

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlumbConfig {
    pub cache: CacheSettings,
    pub retry: RetryPolicy,
    pub audit: AuditSettings,
    pub bus: BusSettings,
    pub metrics: MetricsSettings,
}

impl PlumbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing sections and keys take defaults;
    /// unrecognized keys are a parse error.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from `PLUMB_*` environment variables.
    ///
    /// # Environment Variables
    /// - `PLUMB_CACHE_MODE`: none | ttl-only | ttl-invalidate (default: ttl-invalidate)
    /// - `PLUMB_CACHE_TTL_SECS`: entry TTL (default: 300)
    /// - `PLUMB_RETRY_MAX_ATTEMPTS`: write attempts (default: 5)
    /// - `PLUMB_RETRY_BASE_BACKOFF_MS`: backoff unit (default: 100)
    /// - `PLUMB_AUDIT_STALE_READ_SAMPLE_RATE`: 0.0..=1.0 (default: 0.0)
    /// - `PLUMB_BUS_TOPIC`, `PLUMB_BUS_CONSUMER_GROUP`, `PLUMB_BUS_NAMESPACE`
    /// - `PLUMB_METRICS_PATH`, `PLUMB_METRICS_FLUSH_INTERVAL_SECS`, `PLUMB_METRICS_SERVICE`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PlumbConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("PLUMB_CACHE_MODE") {
            config.cache.mode = raw.parse()?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PLUMB_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "PLUMB_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PLUMB_RETRY_BASE_BACKOFF_MS")? {
            config.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(rate) = parse_var::<f64>(&lookup, "PLUMB_AUDIT_STALE_READ_SAMPLE_RATE")? {
            config.audit.stale_read_sample_rate = rate;
        }
        if let Some(topic) = lookup("PLUMB_BUS_TOPIC") {
            config.bus.topic = topic;
        }
        if let Some(group) = lookup("PLUMB_BUS_CONSUMER_GROUP") {
            config.bus.consumer_group = group;
        }
        if let Some(namespace) = lookup("PLUMB_BUS_NAMESPACE") {
            config.bus.namespace = namespace;
        }
        if let Some(path) = lookup("PLUMB_METRICS_PATH") {
            config.metrics.path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PLUMB_METRICS_FLUSH_INTERVAL_SECS")? {
            config.metrics.flush_interval = Duration::from_secs(secs);
        }
        if let Some(service) = lookup("PLUMB_METRICS_SERVICE") {
            config.metrics.service = service;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the cache mode.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.cache.mode = mode;
        self
    }

    /// Set the cache entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    /// Set the write retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.retry = RetryPolicy::new(max_attempts, base_backoff);
        self
    }

    /// Set the stale-read audit sample rate.
    pub fn with_stale_read_sample_rate(mut self, rate: f64) -> Self {
        self.audit.stale_read_sample_rate = rate;
        self
    }

    /// Set the invalidation namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.bus.namespace = namespace.into();
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - retry.maxAttempts >= 1
    /// - cache.ttl > 0 unless the cache is disabled
    /// - audit.staleReadSampleRate in [0.0, 1.0]
    /// - bus topic, consumer group and namespace are non-empty
    /// - metrics.flushIntervalSecs > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.maxAttempts", "0", "must be at least 1"));
        }
        if self.cache.mode.uses_cache() && self.cache.ttl.is_zero() {
            return Err(invalid(
                "cache.ttl",
                "0",
                "must be positive while caching is enabled",
            ));
        }
        let rate = self.audit.stale_read_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(invalid(
                "audit.staleReadSampleRate",
                &rate.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        for (field, value) in [
            ("bus.topic", &self.bus.topic),
            ("bus.consumerGroup", &self.bus.consumer_group),
            ("bus.namespace", &self.bus.namespace),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, value, "must not be empty"));
            }
        }
        if self.metrics.flush_interval.is_zero() {
            return Err(invalid("metrics.flushIntervalSecs", "0", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}
