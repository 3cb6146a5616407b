//! Tracing subscriber initialization.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and a JSON
//! or human-readable fmt layer. `RUST_LOG` wins over the configured default
//! filter when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::TelemetryError;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "plumb_engine=info,plumb_storage=info,plumb_events=info,warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    #[default]
    Json,
    /// Multi-line human-readable output for local runs.
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log output format (`PLUMB_LOG_FORMAT`: json | pretty)
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset (`PLUMB_LOG_FILTER`)
    pub default_filter: String,
    /// Service name attached to the startup event (`PLUMB_SERVICE_NAME`)
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            service_name: "plumb".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unrecognized formats fall back
    /// to JSON.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            format: lookup("PLUMB_LOG_FORMAT")
                .and_then(|raw| LogFormat::parse(&raw))
                .unwrap_or(defaults.format),
            default_filter: lookup("PLUMB_LOG_FILTER").unwrap_or(defaults.default_filter),
            service_name: lookup("PLUMB_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter).map_err(|e| TelemetryError::Filter {
                filter: self.default_filter.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. A second call fails with [`TelemetryError::Init`].
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(
        service_name = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.service_name, "plumb");
    }

    #[test]
    fn test_telemetry_config_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("PLUMB_LOG_FORMAT", "Pretty"),
            ("PLUMB_LOG_FILTER", "plumb_engine=debug"),
            ("PLUMB_SERVICE_NAME", "catalog"),
        ]));
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.default_filter, "plumb_engine=debug");
        assert_eq!(config.service_name, "catalog");
    }

    #[test]
    fn test_unknown_format_falls_back_to_json() {
        let config = TelemetryConfig::from_lookup(lookup(&[("PLUMB_LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
