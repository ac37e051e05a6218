//! Cache configuration options

use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Durations are written as whole seconds.
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Settings for one cache region (compiled plans or results)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub enabled: bool,
    #[serde(with = "seconds")]
    pub expiry: Duration,
}

impl RegionConfig {
    pub fn new(enabled: bool, expiry: Duration) -> Self {
        Self { enabled, expiry }
    }
}

/// Randomization bounds for the periodic reference sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(with = "seconds")]
    pub min_delay: Duration,
    #[serde(with = "seconds")]
    pub max_delay: Duration,
    #[serde(with = "seconds")]
    pub min_period: Duration,
    #[serde(with = "seconds")]
    pub max_period: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(120),
            min_period: Duration::from_secs(300),
            max_period: Duration::from_secs(600),
        }
    }
}

/// Configuration for the plan and result caches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Compiled plan cache
    pub parsing: RegionConfig,
    /// Materialized result cache
    pub execution: RegionConfig,
    /// Maximum number of entries held by the in-memory backend
    pub max_entries: usize,
    /// Longest wait for a reference bucket lock
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,
    pub sweep: SweepConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            parsing: RegionConfig::new(true, Duration::from_secs(600)),
            execution: RegionConfig::new(false, Duration::from_secs(300)),
            max_entries: 10_000,
            lock_timeout: Duration::from_secs(10),
            sweep: SweepConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Both regions switched off
    pub fn disabled() -> Self {
        let mut config = Self::default();
        config.parsing.enabled = false;
        config.execution.enabled = false;
        config
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| QueryError::ConfigError(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QueryError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| QueryError::ConfigError(e.to_string()))
    }

    pub fn with_parsing(mut self, enabled: bool, expiry: Duration) -> Self {
        self.parsing = RegionConfig::new(enabled, expiry);
        self
    }

    pub fn with_execution(mut self, enabled: bool, expiry: Duration) -> Self {
        self.execution = RegionConfig::new(enabled, expiry);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }
}
