use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main configuration structure for Lockscope.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file is missing.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {:?}: {}. Using defaults.",
                    path.as_ref(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Get the default configuration as a TOML string.
    pub fn default_toml() -> Result<String> {
        let config = Self::default();
        toml::to_string_pretty(&config).context("Failed to serialize default config")
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        if self.engine.sample_interval_ms == 0 {
            anyhow::bail!("sample_interval_ms must be greater than 0");
        }

        if self.engine.buffer_size == 0 || self.engine.batch_size == 0 {
            anyhow::bail!("buffer_size and batch_size must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.analysis.convoy_ownership_ratio) {
            anyhow::bail!(
                "convoy_ownership_ratio must be within [0, 1], got {}",
                self.analysis.convoy_ownership_ratio
            );
        }

        if self.streaming.enabled {
            if self.streaming.channel.trim().is_empty() {
                anyhow::bail!("Streaming requires a channel name");
            }
            if self.streaming.consumer_group.trim().is_empty() {
                anyhow::bail!("Streaming requires a consumer_group");
            }
            if self.streaming.partitions == 0 {
                anyhow::bail!("Streaming channel needs at least one partition");
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {}", other),
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

/// Sampler and ingestion tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            sample_interval_ms: default_sample_interval(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

/// How long histories, accumulators and graph nodes outlive their last sighting.
///
/// A zero value disables the corresponding limit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_cycles")]
    pub retention_cycles: u64,

    #[serde(default = "default_max_snapshots")]
    pub max_snapshots_per_thread: usize,

    #[serde(default = "default_max_lock_events")]
    pub max_events_per_lock: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_cycles: default_retention_cycles(),
            max_snapshots_per_thread: default_max_snapshots(),
            max_events_per_lock: default_max_lock_events(),
        }
    }
}

/// Thresholds and bounds used when ranking contention.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_convoy_ratio")]
    pub convoy_ownership_ratio: f64,

    #[serde(default = "default_convoy_min_waiters")]
    pub convoy_min_waiters: u32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_summary_top_n")]
    pub summary_top_n: usize,

    #[serde(default = "default_hot_stack_limit")]
    pub hot_stack_limit: usize,

    #[serde(default = "default_observation_window")]
    pub observation_window_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            convoy_ownership_ratio: default_convoy_ratio(),
            convoy_min_waiters: default_convoy_min_waiters(),
            top_k: default_top_k(),
            summary_top_n: default_summary_top_n(),
            hot_stack_limit: default_hot_stack_limit(),
            observation_window_ms: default_observation_window(),
        }
    }
}

/// Publish/subscribe distribution of snapshots between processes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    #[serde(default = "default_producer_queue")]
    pub producer_queue: usize,

    #[serde(default = "default_tracked_threads")]
    pub tracked_threads: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: default_channel(),
            consumer_group: default_consumer_group(),
            partitions: default_partitions(),
            poll_timeout_ms: default_poll_timeout(),
            close_timeout_ms: default_close_timeout(),
            producer_queue: default_producer_queue(),
            tracked_threads: default_tracked_threads(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub include_modules: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_modules: false,
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_buffer_size() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    256
}

fn default_flush_interval() -> u64 {
    20
}

fn default_sample_interval() -> u64 {
    1_000
}

fn default_stop_grace() -> u64 {
    5_000
}

fn default_retention_cycles() -> u64 {
    60
}

fn default_max_snapshots() -> usize {
    1_024
}

fn default_max_lock_events() -> usize {
    4_096
}

fn default_convoy_ratio() -> f64 {
    0.6
}

fn default_convoy_min_waiters() -> u32 {
    3
}

fn default_top_k() -> usize {
    10
}

fn default_summary_top_n() -> usize {
    5
}

fn default_hot_stack_limit() -> usize {
    5
}

fn default_observation_window() -> u64 {
    60_000
}

fn default_channel() -> String {
    "thread-snapshots".to_string()
}

fn default_consumer_group() -> String {
    "lockscope-aggregators".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_producer_queue() -> usize {
    4_096
}

fn default_tracked_threads() -> usize {
    16_384
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.sample_interval_ms, 1_000);
        assert_eq!(config.analysis.convoy_ownership_ratio, 0.6);
        assert_eq!(config.analysis.convoy_min_waiters, 3);
        assert_eq!(config.analysis.summary_top_n, 5);
        assert!(!config.streaming.enabled);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.engine.sample_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_streaming_requires_channel() {
        let mut config = Config::default();
        config.streaming.enabled = true;
        config.streaming.channel = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [engine]
            sample_interval_ms = 250

            [analysis]
            convoy_ownership_ratio = 0.75
            top_k = 3

            [streaming]
            enabled = true
            channel = "snapshots-prod"

            [logging]
            level = "debug"
        "#;

        let config = Config::from_str(toml_str).unwrap();
        assert_eq!(config.engine.sample_interval_ms, 250);
        assert_eq!(config.engine.batch_size, 256);
        assert_eq!(config.analysis.convoy_ownership_ratio, 0.75);
        assert_eq!(config.analysis.top_k, 3);
        assert!(config.streaming.enabled);
        assert_eq!(config.streaming.channel, "snapshots-prod");
        assert_eq!(config.streaming.consumer_group, "lockscope-aggregators");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml().unwrap();
        let parsed = Config::from_str(&rendered).unwrap();
        assert_eq!(parsed.retention.retention_cycles, 60);
    }
}
