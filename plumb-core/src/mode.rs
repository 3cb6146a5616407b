//! Process-wide cache mode policy.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// How the cache participates in reads and invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Cache disabled. Every read goes to the store, no invalidation traffic.
    #[serde(alias = "no-op")]
    None,
    /// Entries expire on TTL only. Staleness is bounded by the TTL.
    #[serde(alias = "ttl_only")]
    TtlOnly,
    /// TTL as a backstop plus event-driven eviction.
    #[default]
    #[serde(alias = "ttl_invalidate")]
    TtlInvalidate,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::TtlOnly => "ttl-only",
            Self::TtlInvalidate => "ttl-invalidate",
        }
    }

    /// Whether reads and writes touch the cache at all.
    pub fn uses_cache(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether writes publish, and consumers act on, invalidation events.
    pub fn invalidates(&self) -> bool {
        matches!(self, Self::TtlInvalidate)
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::TtlOnly => 1,
            Self::TtlInvalidate => 2,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::None,
            1 => Self::TtlOnly,
            _ => Self::TtlInvalidate,
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "no-op" => Ok(Self::None),
            "ttl-only" => Ok(Self::TtlOnly),
            "ttl-invalidate" => Ok(Self::TtlInvalidate),
            _ => Err(ConfigError::InvalidValue {
                field: "cache.mode".to_string(),
                value: s.to_string(),
                reason: "expected one of none, ttl-only, ttl-invalidate".to_string(),
            }),
        }
    }
}

/// Shared, runtime-switchable cache mode.
///
/// The read path, the write path and the invalidation consumer consult this
/// on every call, so flipping it takes effect without rebuilding anything.
#[derive(Debug)]
pub struct CacheModeSwitch {
    mode: AtomicU8,
}

impl CacheModeSwitch {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_byte()),
        }
    }

    pub fn current(&self) -> CacheMode {
        CacheMode::from_byte(self.mode.load(Ordering::Acquire))
    }

    /// Set the mode, returning the previous one.
    pub fn set(&self, mode: CacheMode) -> CacheMode {
        CacheMode::from_byte(self.mode.swap(mode.to_byte(), Ordering::AcqRel))
    }
}

impl Default for CacheModeSwitch {
    fn default() -> Self {
        Self::new(CacheMode::default())
    }
}
