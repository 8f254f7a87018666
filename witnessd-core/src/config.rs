use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::vdf::Parameters as VdfParameters;

const CONFIG_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: {0} must be positive")]
    NonPositive(&'static str),
    #[error("config: wal sync interval {0} ms exceeds the 100 ms bound")]
    SyncIntervalTooLong(u64),
    #[error("config: min_iterations exceeds max_iterations")]
    InvertedIterationBounds,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub vdf: VdfConfig,

    #[serde(default)]
    pub sentinel: SentinelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfConfig {
    #[serde(default = "default_ips")]
    pub iterations_per_second: u64,
    #[serde(default = "default_min_iter")]
    pub min_iterations: u64,
    #[serde(default = "default_max_iter")]
    pub max_iterations: u64,
    #[serde(default)]
    pub calibrated: bool,
}

impl Default for VdfConfig {
    fn default() -> Self {
        Self {
            iterations_per_second: default_ips(),
            min_iterations: default_min_iter(),
            max_iterations: default_max_iter(),
            calibrated: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_checkpoint")]
    pub checkpoint_interval_secs: u64,
    /// Bound on WAL data loss after a crash.
    #[serde(default = "default_wal_sync")]
    pub wal_sync_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            heartbeat_interval_secs: default_heartbeat(),
            checkpoint_interval_secs: default_checkpoint(),
            wal_sync_interval_ms: default_wal_sync(),
            event_queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            vdf: VdfConfig::default(),
            sentinel: SentinelConfig::default(),
        }
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}
fn default_ips() -> u64 {
    1_000_000
}
fn default_min_iter() -> u64 {
    100_000
}
fn default_max_iter() -> u64 {
    3_600_000_000
}
fn default_heartbeat() -> u64 {
    60
}
fn default_checkpoint() -> u64 {
    60
}
fn default_wal_sync() -> u64 {
    100
}
fn default_queue_capacity() -> usize {
    256
}

impl Config {
    pub fn load_or_default(config_path: &Path) -> Result<Self, ConfigError> {
        if config_path.exists() {
            let raw = fs::read_to_string(config_path)?;
            let config: Config = serde_json::from_str(&raw)?;
            config.validate()?;
            return Ok(config);
        }

        let config = Config::default();
        config.persist(config_path)?;
        Ok(config)
    }

    pub fn persist(&self, config_path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vdf.iterations_per_second == 0 {
            return Err(ConfigError::NonPositive("vdf.iterations_per_second"));
        }
        if self.vdf.min_iterations > self.vdf.max_iterations {
            return Err(ConfigError::InvertedIterationBounds);
        }
        if self.sentinel.heartbeat_interval_secs == 0 {
            return Err(ConfigError::NonPositive("sentinel.heartbeat_interval_secs"));
        }
        if self.sentinel.checkpoint_interval_secs == 0 {
            return Err(ConfigError::NonPositive("sentinel.checkpoint_interval_secs"));
        }
        if self.sentinel.wal_sync_interval_ms == 0 {
            return Err(ConfigError::NonPositive("sentinel.wal_sync_interval_ms"));
        }
        if self.sentinel.wal_sync_interval_ms > 100 {
            return Err(ConfigError::SyncIntervalTooLong(
                self.sentinel.wal_sync_interval_ms,
            ));
        }
        if self.sentinel.event_queue_capacity == 0 {
            return Err(ConfigError::NonPositive("sentinel.event_queue_capacity"));
        }
        Ok(())
    }

    pub fn set_vdf_parameters(&mut self, params: VdfParameters) {
        self.vdf.iterations_per_second = params.iterations_per_second;
        self.vdf.min_iterations = params.min_iterations;
        self.vdf.max_iterations = params.max_iterations;
        self.vdf.calibrated = params.calibrated;
    }
}

impl From<&Config> for VdfParameters {
    fn from(config: &Config) -> Self {
        Self {
            iterations_per_second: config.vdf.iterations_per_second,
            min_iterations: config.vdf.min_iterations,
            max_iterations: config.vdf.max_iterations,
            calibrated: config.vdf.calibrated,
        }
    }
}
