//! Errors raised while assembling engine components.

use plumb_core::{BusError, ConfigError};
use thiserror::Error;

use crate::metrics::MetricsError;

#[derive(Debug, Error)]
pub enum EngineBuildError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics setup failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Subscription failed: {0}")]
    Subscribe(#[from] BusError),

    #[error("Metrics file error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to init subscriber: {0}")]
    Init(String),
}
