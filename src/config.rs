//! Configuration management for the CloudRAID engine

use crate::error::{Error, Result};
use crate::raid::MAX_NUMLINES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of I/O schedulers
pub const DEFAULT_WORKERS: usize = 2;

/// Consecutive failures tolerated on one shard before it is given up
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-request retrieval tuning
    pub engine: EngineConfig,

    /// I/O scheduler pool
    pub scheduler: SchedulerConfig,
}

/// Tuning for a single retrieval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on RAID lines held in the reconstruction buffer
    pub max_lines: usize,

    /// Consecutive failures on a shard before it counts as exhausted
    pub max_retries: u32,

    /// Base delay for exponential retry backoff (ms)
    pub retry_delay_ms: u64,

    /// Ceiling for the retry backoff (ms)
    pub max_backoff_ms: u64,

    /// Silence on an in-flight fast shard before the watchdog intervenes (ms)
    pub hang_threshold_ms: u64,

    /// Idle time before a stalled feed is reported (ms)
    pub stall_report_ms: u64,

    /// Idle time after which a request is aborted (ms)
    pub feed_timeout_ms: u64,

    /// Upper bound on how long a blocked reader sleeps between checks (ms)
    pub reader_wake_ms: u64,
}

/// I/O scheduler pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of scheduler worker threads
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_lines: MAX_NUMLINES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: 3_000,
            max_backoff_ms: 30_000,
            hang_threshold_ms: 30_000,
            stall_report_ms: 100_000,
            feed_timeout_ms: 150_000,
            reader_wake_ms: 250,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: DEFAULT_WORKERS,
        }
    }
}

impl EngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn hang_threshold(&self) -> Duration {
        Duration::from_millis(self.hang_threshold_ms)
    }

    pub fn stall_report(&self) -> Duration {
        Duration::from_millis(self.stall_report_ms)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    pub fn reader_wake(&self) -> Duration {
        Duration::from_millis(self.reader_wake_ms)
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudraid")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file at `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(workers) = env_number::<usize>("CLOUDRAID_WORKERS") {
            self.scheduler.workers = workers;
        }

        if let Some(lines) = env_number::<usize>("CLOUDRAID_MAX_LINES") {
            self.engine.max_lines = lines;
        }

        if let Some(retries) = env_number::<u32>("CLOUDRAID_MAX_RETRIES") {
            self.engine.max_retries = retries;
        }

        if let Some(ms) = env_number::<u64>("CLOUDRAID_HANG_THRESHOLD_MS") {
            self.engine.hang_threshold_ms = ms;
        }

        if let Some(ms) = env_number::<u64>("CLOUDRAID_FEED_TIMEOUT_MS") {
            self.engine.feed_timeout_ms = ms;
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            return Err(Error::InvalidConfig(
                "At least one scheduler worker is required".to_string(),
            ));
        }

        if self.engine.max_lines == 0 || self.engine.max_lines > MAX_NUMLINES {
            return Err(Error::InvalidConfig(format!(
                "max_lines must be between 1 and {}",
                MAX_NUMLINES
            )));
        }

        if self.engine.retry_delay_ms > self.engine.max_backoff_ms {
            return Err(Error::InvalidConfig(
                "retry_delay_ms must not exceed max_backoff_ms".to_string(),
            ));
        }

        if self.engine.stall_report_ms > self.engine.feed_timeout_ms {
            return Err(Error::InvalidConfig(
                "stall_report_ms must not exceed feed_timeout_ms".to_string(),
            ));
        }

        if self.engine.reader_wake_ms == 0 {
            return Err(Error::InvalidConfig(
                "reader_wake_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}
