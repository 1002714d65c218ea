//! Tracing subscriber setup
//!
//! The crate logs through `tracing`; every composition runs inside a
//! `compose` span carrying its id and label. This module wires a subscriber
//! for binaries and tests that do not bring their own.
//!
//! ```rust,ignore
//! use streamsplice::telemetry::{init_subscriber, OutputFormat, SubscriberConfig};
//!
//! let _guard = init_subscriber(
//!     SubscriberConfig::builder()
//!         .log_level(tracing::Level::DEBUG)
//!         .output_format(OutputFormat::Json)
//!         .build(),
//! )?;
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_LEVEL: &str = "STREAMSPLICE_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "STREAMSPLICE_LOG_FORMAT";
pub const ENV_LOG_FILE: &str = "STREAMSPLICE_LOG_FILE";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}. Valid options: trace, debug, info, warn, error")]
    InvalidLevel(String),

    #[error("invalid log format: {0}. Valid options: text, json, json-compact")]
    InvalidFormat(String),

    #[error("invalid log file path: {0}")]
    InvalidPath(String),

    #[error("failed to initialize tracing: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Output format for tracing logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format
    Json,
    /// Compact JSON format
    JsonCompact,
}

impl std::str::FromStr for OutputFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "json-compact" => Ok(Self::JsonCompact),
            _ => Err(TelemetryError::InvalidFormat(s.to_string())),
        }
    }
}

/// Configuration for the tracing subscriber
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub log_level: tracing::Level,
    pub output_format: OutputFormat,
    /// Write to stdout when no log file is set.
    pub enable_console: bool,
    /// Non-blocking file output; takes precedence over the console.
    pub log_file: Option<PathBuf>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            output_format: OutputFormat::Text,
            enable_console: true,
            log_file: None,
        }
    }
}

impl SubscriberConfig {
    pub fn builder() -> SubscriberConfigBuilder {
        SubscriberConfigBuilder::default()
    }

    pub fn debug() -> Self {
        Self {
            log_level: tracing::Level::DEBUG,
            ..Self::default()
        }
    }

    pub fn production(log_file: PathBuf) -> Self {
        Self {
            log_level: tracing::Level::WARN,
            output_format: OutputFormat::Json,
            enable_console: false,
            log_file: Some(log_file),
        }
    }

    fn filter(&self) -> EnvFilter {
        let level = self.log_level.as_str().to_lowercase();
        EnvFilter::new(format!("streamsplice={level}"))
    }
}

/// Builder for [`SubscriberConfig`]
#[derive(Debug, Default)]
pub struct SubscriberConfigBuilder {
    log_level: Option<tracing::Level>,
    output_format: Option<OutputFormat>,
    enable_console: Option<bool>,
    log_file: Option<PathBuf>,
}

impl SubscriberConfigBuilder {
    pub fn log_level(mut self, level: tracing::Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Set the log level from a string
    pub fn log_level_str(mut self, level: &str) -> Result<Self> {
        let parsed = level
            .parse::<tracing::Level>()
            .map_err(|_| TelemetryError::InvalidLevel(level.to_string()))?;
        self.log_level = Some(parsed);
        Ok(self)
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn enable_console(mut self, enable: bool) -> Self {
        self.enable_console = Some(enable);
        self
    }

    pub fn log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    pub fn build(self) -> SubscriberConfig {
        SubscriberConfig {
            log_level: self.log_level.unwrap_or(tracing::Level::INFO),
            output_format: self.output_format.unwrap_or_default(),
            enable_console: self.enable_console.unwrap_or(true),
            log_file: self.log_file,
        }
    }
}

macro_rules! try_init_fmt {
    ($config:expr, $writer:expr) => {{
        let builder = tracing_subscriber::fmt()
            .with_env_filter($config.filter())
            .with_target(true)
            .with_writer($writer);
        match $config.output_format {
            OutputFormat::Json => builder
                .with_thread_ids(true)
                .with_thread_names(true)
                .json()
                .try_init(),
            OutputFormat::JsonCompact => builder
                .with_thread_ids(true)
                .with_thread_names(true)
                .json()
                .flatten_event(true)
                .try_init(),
            OutputFormat::Text => builder.compact().try_init(),
        }
    }};
}

/// Install a global subscriber.
///
/// Returns the file writer's guard when a log file is configured; it must be
/// kept alive for buffered lines to be flushed. An already installed global
/// subscriber is not an error.
pub fn init_subscriber(config: SubscriberConfig) -> Result<Option<WorkerGuard>> {
    let (init_result, guard) = match &config.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| TelemetryError::InvalidPath(path.display().to_string()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (try_init_fmt!(config, writer), Some(guard))
        }
        None if config.enable_console => (try_init_fmt!(config, std::io::stdout), None),
        None => (try_init_fmt!(config, std::io::sink), None),
    };

    match init_result {
        Ok(()) => Ok(guard),
        Err(e) => {
            let message = e.to_string();
            if message.contains("already been set") || message.contains("already initialized") {
                Ok(guard)
            } else {
                Err(TelemetryError::Init(message))
            }
        }
    }
}

pub fn init_default() -> Result<Option<WorkerGuard>> {
    init_subscriber(SubscriberConfig::default())
}

pub fn init_debug() -> Result<Option<WorkerGuard>> {
    init_subscriber(SubscriberConfig::debug())
}

/// Install a subscriber configured from the environment.
///
/// - `STREAMSPLICE_LOG_LEVEL`: trace, debug, info, warn, error
/// - `STREAMSPLICE_LOG_FORMAT`: text, json, json-compact
/// - `STREAMSPLICE_LOG_FILE`: log file path
pub fn init_from_env() -> Result<Option<WorkerGuard>> {
    init_subscriber(config_from_lookup(|var| std::env::var(var).ok())?)
}

fn config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<SubscriberConfig> {
    let mut builder = SubscriberConfig::builder();
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        builder = builder.log_level_str(&level)?;
    }
    if let Some(format) = lookup(ENV_LOG_FORMAT) {
        builder = builder.output_format(format.parse()?);
    }
    if let Some(path) = lookup(ENV_LOG_FILE) {
        builder = builder.log_file(PathBuf::from(path));
    }
    Ok(builder.build())
}
