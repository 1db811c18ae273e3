//! Configuration management for cncflow
//!
//! Handles loading and validation of cncflow.toml configuration files.
//! Every field has a default, so an empty file is a valid configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Import loop settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry settings around one batch
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-command consolidation settings
    #[serde(default)]
    pub strategies: StrategiesConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Idle sleep between iterations in milliseconds
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,

    /// Maximum records peeked per iteration
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Below this many peeked records, wait for more unless the oldest is old enough
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Age in seconds after which a short window is processed anyway
    #[serde(default = "default_process_anyway_secs")]
    pub process_anyway_secs: u64,

    /// Delay between queue initialization attempts in milliseconds
    #[serde(default = "default_init_retry_ms")]
    pub init_retry_ms: u64,

    /// Queue vacuum check period in seconds
    #[serde(default = "default_hourly")]
    pub vacuum_interval_secs: u64,

    /// Stale detection cleanup period in seconds
    #[serde(default = "default_hourly")]
    pub cleanup_interval_secs: u64,

    /// Detections older than this many days are deleted
    #[serde(default = "default_retention_days")]
    pub detection_retention_days: u32,

    /// Force the machine-mode queue if it was not visited for this many seconds
    #[serde(default = "default_machine_mode_visit_secs")]
    pub machine_mode_visit_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_ms: default_sleep_ms(),
            fetch_size: default_fetch_size(),
            min_batch_size: default_min_batch_size(),
            process_anyway_secs: default_process_anyway_secs(),
            init_retry_ms: default_init_retry_ms(),
            vacuum_interval_secs: default_hourly(),
            cleanup_interval_secs: default_hourly(),
            detection_retention_days: default_retention_days(),
            machine_mode_visit_secs: default_machine_mode_visit_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }

    pub fn init_retry(&self) -> Duration {
        Duration::from_millis(self.init_retry_ms)
    }

    pub fn process_anyway_age(&self) -> TimeDelta {
        secs(self.process_anyway_secs)
    }

    pub fn vacuum_interval(&self) -> TimeDelta {
        secs(self.vacuum_interval_secs)
    }

    pub fn cleanup_interval(&self) -> TimeDelta {
        secs(self.cleanup_interval_secs)
    }

    pub fn detection_retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.detection_retention_days))
    }

    pub fn machine_mode_visit_interval(&self) -> TimeDelta {
        secs(self.machine_mode_visit_secs)
    }
}

fn default_sleep_ms() -> u64 {
    1000
}

fn default_fetch_size() -> usize {
    100
}

fn default_min_batch_size() -> usize {
    1
}

fn default_process_anyway_secs() -> u64 {
    10
}

fn default_init_retry_ms() -> u64 {
    5000
}

fn default_hourly() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    30
}

fn default_machine_mode_visit_secs() -> u64 {
    60
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempt ceiling, including the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep before retrying a delayed transient fault, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    /// Upper bound for the backoff delay, in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delay multiplier per delayed retry (1.0 keeps the delay constant)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Random jitter as a fraction of the delay
    #[serde(default)]
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
            self.max_attempts,
        )
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.0
}

/// Consolidation strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategiesConfig {
    /// Max gap in seconds before a machine-mode interval stops extending
    #[serde(default = "default_max_gap_secs")]
    pub machine_mode_max_gap_secs: u64,

    /// Max gap in seconds for module activity periods
    #[serde(default = "default_max_gap_secs")]
    pub activity_max_gap_secs: u64,

    /// State used to fill activity gaps wider than the max gap
    #[serde(default)]
    pub activity_default_state: i64,

    #[serde(default = "default_max_gap_secs")]
    pub alarms_max_gap_secs: u64,

    #[serde(default = "default_max_gap_secs")]
    pub variables_max_gap_secs: u64,

    #[serde(default = "default_max_gap_secs")]
    pub stamps_max_gap_secs: u64,

    /// Create unknown stamps instead of rejecting their detections
    #[serde(default)]
    pub auto_create_stamps: bool,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            machine_mode_max_gap_secs: default_max_gap_secs(),
            activity_max_gap_secs: default_max_gap_secs(),
            activity_default_state: 0,
            alarms_max_gap_secs: default_max_gap_secs(),
            variables_max_gap_secs: default_max_gap_secs(),
            stamps_max_gap_secs: default_max_gap_secs(),
            auto_create_stamps: false,
        }
    }
}

fn default_max_gap_secs() -> u64 {
    60
}

impl StrategiesConfig {
    pub fn machine_mode_max_gap(&self) -> TimeDelta {
        secs(self.machine_mode_max_gap_secs)
    }

    pub fn activity_max_gap(&self) -> TimeDelta {
        secs(self.activity_max_gap_secs)
    }

    pub fn alarms_max_gap(&self) -> TimeDelta {
        secs(self.alarms_max_gap_secs)
    }

    pub fn variables_max_gap(&self) -> TimeDelta {
        secs(self.variables_max_gap_secs)
    }

    pub fn stamps_max_gap(&self) -> TimeDelta {
        secs(self.stamps_max_gap_secs)
    }
}

/// Seconds as a `TimeDelta`, saturating on absurd values.
fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `cncflow default-config`)
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject values the import loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.fetch_size == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.fetch_size must be at least 1".to_string(),
            ));
        }
        if s.min_batch_size > s.fetch_size {
            return Err(ConfigError::ValidationError(format!(
                "scheduler.min_batch_size ({}) exceeds scheduler.fetch_size ({})",
                s.min_batch_size, s.fetch_size
            )));
        }
        if s.sleep_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.sleep_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(ConfigError::ValidationError(
                "retry.jitter_percent must be within [0, 1]".to_string(),
            ));
        }
        if self.retry.delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if crate::logging::parse_level(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "logging.level: unknown level {}",
                self.logging.level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.sleep_ms, 1000);
        assert_eq!(config.scheduler.fetch_size, 100);
        assert_eq!(config.scheduler.min_batch_size, 1);
        assert_eq!(config.scheduler.process_anyway_secs, 10);
        assert_eq!(config.scheduler.init_retry_ms, 5000);
        assert_eq!(config.scheduler.detection_retention_days, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, 1000);
        assert_eq!(config.strategies.machine_mode_max_gap_secs, 60);
        assert!(!config.strategies.auto_create_stamps);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[scheduler]
fetch_size = 20

[strategies]
activity_default_state = 4
auto_create_stamps = true

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.fetch_size, 20);
        assert_eq!(config.scheduler.sleep_ms, 1000);
        assert_eq!(config.strategies.activity_default_state, 4);
        assert!(config.strategies.auto_create_stamps);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let err = Config::from_toml_str("[scheduler]\nfetch_size = 0\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ValidationError(_))
        ));

        let err = Config::from_toml_str("[scheduler]\nfetch_size = 5\nmin_batch_size = 6\n")
            .unwrap_err();
        assert!(err.to_string().contains("min_batch_size"));

        let err = Config::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));

        let err = Config::from_toml_str("[retry]\ndelay_ms = 500\nmax_delay_ms = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("retry.delay_ms (500) exceeds"));

        let err = Config::from_toml_str("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = Config::from_toml_str("[scheduler\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cncflow.toml");
        std::fs::write(&path, "[retry]\ndelay_ms = 250\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.retry.delay_ms, 250);
        assert_eq!(config.retry.policy().initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn durations_convert() {
        let s = SchedulerConfig::default();
        assert_eq!(s.sleep(), Duration::from_secs(1));
        assert_eq!(s.process_anyway_age(), TimeDelta::seconds(10));
        assert_eq!(s.detection_retention(), TimeDelta::days(30));
        assert_eq!(
            StrategiesConfig::default().machine_mode_max_gap(),
            TimeDelta::seconds(60)
        );
        assert_eq!(secs(u64::MAX), TimeDelta::MAX);
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
