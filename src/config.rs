//! Engine configuration.
//!
//! YAML-backed configuration with per-component sections, validated after
//! load. Every field has a default mirroring the production constants, so a
//! partial file (or none at all) yields a working engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub aggregator: AggregatorConfig,
    pub poller: PollerConfig,
    pub fanout: FanoutConfig,
    pub health: HealthConfig,
}

/// TTL cache manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Forced-release deadline for locked sections, in seconds.
    pub lock_deadline_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_deadline_secs: 5,
        }
    }
}

impl CacheConfig {
    pub fn lock_deadline(&self) -> Duration {
        Duration::from_secs(self.lock_deadline_secs)
    }
}

/// Debounce aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Quiet period after the last fragment before an aggregate finalizes,
    /// in milliseconds.
    pub window_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { window_ms: 500 }
    }
}

impl AggregatorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Which adaptive-poll backoff policy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Decay toward `min_interval` by a third per empty poll.
    DecayTowardFloor,
    /// Double toward `max_interval` per empty poll.
    ExponentialGrowth,
}

/// Adaptive poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Newest items requested per poll.
    pub fetch_count: usize,
    pub strategy: BackoffStrategy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 6 * 60 * 60,
            fetch_count: 5,
            strategy: BackoffStrategy::DecayTowardFloor,
        }
    }
}

impl PollerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

/// Notification fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Buffer size of each change-event channel and of the merged stream.
    pub channel_buffer: usize,
    /// Messages per catch-up page.
    pub page_size: u32,
    pub heartbeat_interval_secs: u64,
    /// Bounded wait for a pong before the connection is force-closed.
    pub heartbeat_timeout_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 32,
            page_size: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

impl FanoutConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Cache health supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sleep between reachability probes while recovering, in seconds.
    pub retry_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 10,
        }
    }
}

impl HealthConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl EngineConfig {
    /// Load from a YAML file and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Configuration(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse from a YAML string and validate.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(raw)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poller.min_interval_secs == 0 {
            return Err(EngineError::Configuration(
                "poller.min_interval_secs must be positive".to_string(),
            ));
        }
        if self.poller.min_interval_secs > self.poller.max_interval_secs {
            return Err(EngineError::Configuration(format!(
                "poller.min_interval_secs ({}) exceeds poller.max_interval_secs ({})",
                self.poller.min_interval_secs, self.poller.max_interval_secs
            )));
        }
        if self.fanout.channel_buffer == 0 {
            return Err(EngineError::Configuration(
                "fanout.channel_buffer must be positive".to_string(),
            ));
        }
        if self.fanout.page_size == 0 {
            return Err(EngineError::Configuration(
                "fanout.page_size must be positive".to_string(),
            ));
        }
        if self.cache.lock_deadline_secs == 0 {
            return Err(EngineError::Configuration(
                "cache.lock_deadline_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
