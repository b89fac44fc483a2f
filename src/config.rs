//! Configuration management for evtelemetry
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files, with overrides taken from any
//! [`SettingsProvider`] (environment variables, in-memory maps, or a layered
//! combination of both).

use crate::error::{Result, TelemetryError};
use crate::source::SourceKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;
pub mod settings;

pub use settings::{EnvSettings, LayeredSettings, MapSettings, SettingsProvider};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll cycle timing
    pub poll: PollConfig,

    /// Data source ranking and per-source settings
    pub sources: SourcesConfig,

    /// Charging session detection thresholds
    pub session: SessionConfig,

    /// Completed session archive
    pub archive: ArchiveConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Poll cycle scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Base cycle period in milliseconds
    pub interval_ms: u64,

    /// Period of low-priority PIDs in milliseconds, rounded to whole cycles
    pub low_priority_interval_ms: u64,

    /// Timeout of one adapter request in milliseconds
    pub request_timeout_ms: u64,

    /// Fully failed cycles in a row before the adapter is considered gone
    pub max_consecutive_failures: u32,
}

/// Data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Provider ranking, highest priority first
    pub ranking: Vec<SourceKind>,

    /// OBD-II adapter source
    pub obd: ObdConfig,

    /// Cloud vehicle-info API source
    pub cloud: CloudConfig,

    /// Synthetic feed
    pub mock: MockConfig,
}

/// OBD-II adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    /// Optional JSON PID table; the built-in EV table is used when absent
    pub pid_file: Option<String>,

    /// Commands sent once after the link opens
    pub init_commands: Vec<String>,

    /// Delay between reconnect attempts after the adapter is lost
    pub reconnect_interval_ms: u64,
}

/// Cloud vehicle-info API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Whether the cloud source participates in arbitration
    pub enabled: bool,

    /// API base URL
    pub base_url: String,

    /// Vehicle identifier at the API
    pub vehicle_id: String,

    /// Bearer token
    pub access_token: String,

    /// Refresh period in milliseconds
    pub refresh_interval_ms: u64,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Synthetic feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Whether the mock source participates in arbitration
    pub enabled: bool,

    /// Emission period in milliseconds
    pub interval_ms: u64,

    /// Noise generator seed
    pub seed: u64,

    /// State of charge at start (%)
    pub start_soc: f64,
}

/// Charging session detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum cumulative-charge rise (Ah) between samples that counts as charging
    pub charge_rise_threshold_ah: f64,

    /// Samples without a rise before a counter-detected session ends
    pub idle_samples_to_end: u32,

    /// State of charge at which charging counts as complete
    pub full_soc_percent: f64,

    /// Counter drops up to this many Ah are treated as noise
    pub counter_reset_tolerance_ah: f64,
}

/// Completed session archive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Path of the JSON archive file
    pub path: String,

    /// Maximum number of sessions kept in the archive
    pub max_sessions: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file or directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "evtelemetry.yaml",
            "/data/evtelemetry.yaml",
            "/etc/evtelemetry/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Override tunables with values answered by a settings provider
    pub fn apply_settings(&mut self, settings: &dyn SettingsProvider) -> Result<()> {
        if let Some(v) = settings.get_int("poll.interval_ms") {
            self.poll.interval_ms = non_negative("poll.interval_ms", v)?;
        }
        if let Some(v) = settings.get_int("poll.low_priority_interval_ms") {
            self.poll.low_priority_interval_ms = non_negative("poll.low_priority_interval_ms", v)?;
        }
        if let Some(v) = settings.get_int("poll.request_timeout_ms") {
            self.poll.request_timeout_ms = non_negative("poll.request_timeout_ms", v)?;
        }
        if let Some(v) = settings.get_string("sources.ranking") {
            self.sources.ranking = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<SourceKind>()
                        .map_err(|e| TelemetryError::validation("sources.ranking", &e))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = settings.get_bool("sources.cloud.enabled") {
            self.sources.cloud.enabled = v;
        }
        if let Some(v) = settings.get_string("sources.cloud.access_token") {
            self.sources.cloud.access_token = v;
        }
        if let Some(v) = settings.get_bool("sources.mock.enabled") {
            self.sources.mock.enabled = v;
        }
        if let Some(v) = settings.get_int("sources.mock.seed") {
            self.sources.mock.seed = non_negative("sources.mock.seed", v)?;
        }
        if let Some(v) = settings.get_float("session.charge_rise_threshold_ah") {
            self.session.charge_rise_threshold_ah = v;
        }
        if let Some(v) = settings.get_int("session.idle_samples_to_end") {
            self.session.idle_samples_to_end = u32::try_from(v).map_err(|_| {
                TelemetryError::validation("session.idle_samples_to_end", "Out of range")
            })?;
        }
        if let Some(v) = settings.get_string("logging.level") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_ms == 0 {
            return Err(TelemetryError::validation(
                "poll.interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.poll.low_priority_interval_ms < self.poll.interval_ms {
            return Err(TelemetryError::validation(
                "poll.low_priority_interval_ms",
                "Must not be shorter than poll.interval_ms",
            ));
        }

        if self.poll.request_timeout_ms == 0 {
            return Err(TelemetryError::validation(
                "poll.request_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.sources.ranking.is_empty() {
            return Err(TelemetryError::validation(
                "sources.ranking",
                "At least one data source is required",
            ));
        }

        for (i, kind) in self.sources.ranking.iter().enumerate() {
            if self.sources.ranking[..i].contains(kind) {
                return Err(TelemetryError::validation(
                    "sources.ranking".to_string(),
                    format!("Duplicate source {}", kind),
                ));
            }
        }

        if self.sources.cloud.enabled && self.sources.cloud.base_url.is_empty() {
            return Err(TelemetryError::validation(
                "sources.cloud.base_url",
                "Base URL cannot be empty when the cloud source is enabled",
            ));
        }

        if self.session.charge_rise_threshold_ah <= 0.0 {
            return Err(TelemetryError::validation(
                "session.charge_rise_threshold_ah",
                "Must be positive",
            ));
        }

        if self.session.idle_samples_to_end == 0 {
            return Err(TelemetryError::validation(
                "session.idle_samples_to_end",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Low-priority period expressed in whole poll cycles (at least 1)
    pub fn low_priority_period_cycles(&self) -> u64 {
        if self.poll.interval_ms == 0 {
            return 1;
        }
        (self.poll.low_priority_interval_ms / self.poll.interval_ms).max(1)
    }
}

fn non_negative(field: &str, v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| TelemetryError::validation(field, "Must not be negative"))
}
