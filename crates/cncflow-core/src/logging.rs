//! Structured logging for cncflow
//!
//! `tracing` events go to stderr, pretty or as JSON lines, and optionally to
//! an append-only log file in the same format.
//!
//! Events use these field names:
//! - `module_id`: Machine module identifier
//! - `command`: Command tag of the batch being processed
//! - `batch_len`: Number of records in the batch
//! - `attempt`: Retry attempt number
//! - `fault`: Fault class of a failure

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::fmt::format::{Format, Json, JsonFields};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to log file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Parse a `logging.level` value.
pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "unknown log level: {level}. Expected one of: trace, debug, info, warn, error"
        )),
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber.
///
/// A second call fails with [`LogError::SetSubscriber`]. `RUST_LOG`
/// overrides the configured level, e.g. `RUST_LOG=cncflow_core=debug`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let stderr = fmt::layer().with_writer(io::stderr).with_target(true);
            let file = file.map(|file| fmt::layer().with_writer(file).with_ansi(false));
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr)
                .with(file);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let stderr = json_layer().with_writer(io::stderr);
            let file = file.map(|file| json_layer().with_writer(file));
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr)
                .with(file);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

fn json_layer<S>() -> fmt::Layer<S, JsonFields, Format<Json, SystemTime>> {
    fmt::layer()
        .json()
        .with_timer(SystemTime)
        .with_target(true)
        .with_current_span(true)
        .flatten_event(true)
}
