//! Logging configuration and initialization
//!
//! The allocator only emits `tracing` events; installing a subscriber is up
//! to the embedding process. This module provides the default one: human
//! or JSON output on stderr, optionally mirrored as JSON into a file.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "rocm_devcache=trace")
//! - `DEVCACHE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `DEVCACHE_LOG_FORMAT`: Output format ("human" or "json")
//! - `DEVCACHE_LOG_FILE`: Optional file path for JSON log output

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Set once a subscriber has been installed by this module
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "DEVCACHE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "DEVCACHE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "DEVCACHE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber was installed first
    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line in console output
    pub with_file_info: bool,
    /// Emit an event when a span closes
    pub with_span_events: bool,
    /// Mirror events as JSON into this file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Read `DEVCACHE_LOG_LEVEL`, `DEVCACHE_LOG_FORMAT` and `DEVCACHE_LOG_FILE`
    ///
    /// Unset variables keep their defaults; unparseable ones are errors.
    pub fn from_env() -> Result<Self, LoggingError> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(LOG_LEVEL_ENV) {
            config.level =
                LogLevel::from_str(&value).ok_or(LoggingError::InvalidLogLevel(value))?;
        }
        if let Ok(value) = std::env::var(LOG_FORMAT_ENV) {
            config.format =
                LogFormat::from_str(&value).ok_or(LoggingError::InvalidLogFormat(value))?;
        }
        if let Ok(value) = std::env::var(LOG_FILE_ENV) {
            if !value.trim().is_empty() {
                config.log_file = Some(PathBuf::from(value));
            }
        }

        Ok(config)
    }
}

/// Install the default subscriber, ignoring configuration errors
///
/// Idempotent: only the first call has any effect.
pub fn init_logging_default() {
    if let Err(err) = init_logging_from_env() {
        eprintln!("devcache: logging not initialized: {}", err);
    }
}

/// Install a subscriber configured from the environment
///
/// Idempotent: once a subscriber is installed, later calls return `Ok`.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    if is_initialized() {
        return Ok(());
    }
    init_with_config(&LoggingConfig::from_env()?)
}

/// Install a subscriber for `config`
///
/// Idempotent: once a subscriber is installed, later calls return `Ok`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    if is_initialized() {
        return Ok(());
    }
    build_subscriber(config)?
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

/// Subscriber for `config` without installing it
pub fn build_subscriber(config: &LoggingConfig) -> Result<impl Subscriber + Send + Sync, LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    match config.format {
        LogFormat::Human => layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        ),
        LogFormat::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        ),
    }

    if let Some(path) = &config.log_file {
        let file = open_log_file(path)?;
        // File output is always JSON
        layers.push(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        );
    }

    Ok(tracing_subscriber::registry().with(layers).with(env_filter))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(format!("{}: {}", path.display(), e)))
}

/// `RUST_LOG` wins over the configured level
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}
