//! # Logging Utilities
//!
//! Logging infrastructure for crashcap using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty output for terminals and JSON for log collectors
//! - Environment variable configuration
//! - Optional file output through a non-blocking writer
//!
//! Only healthy code paths log. The fault handler never touches the
//! subscriber, since formatting and locking are not allowed there.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crashcap_utils::init_logging;
//!
//! // Keep the guard alive for as long as file output should be flushed
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: log filter (e.g., `RUST_LOG=debug`, `RUST_LOG=crashcap_core=trace`)
//! - `CRASHCAP_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
//! - `CRASHCAP_LOG_FILE`: optional log file, rotated daily, written in addition to stderr
//!
//! Hosts that own the standard streams (an app embedding the FFI library)
//! should use [`init_logging_file_only`] instead.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs, io};

use chrono::Utc;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format override
pub const LOG_FORMAT_ENV: &str = "CRASHCAP_LOG_FORMAT";
/// Optional log file path
pub const LOG_FILE_ENV: &str = "CRASHCAP_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    Debug,
    /// Most verbose
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Flushes buffered file output when dropped
///
/// Returned by every initializer. Console-only setups hold nothing, but the
/// guard should still be kept for the lifetime of the program.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LogGuard
{
    file: Option<WorkerGuard>,
}

impl LogGuard
{
    /// Whether events are also written to a file
    pub const fn has_file(&self) -> bool
    {
        self.file.is_some()
    }
}

/// Initialize logging from the environment
///
/// Events go to stderr, so command output on stdout stays machine-readable.
/// If `CRASHCAP_LOG_FILE` is set they are also written to that file, rotated
/// daily.
///
/// ## Errors
///
/// Returns an error if:
/// - a subscriber is already installed
/// - `CRASHCAP_LOG_FORMAT` holds an unknown format
/// - the log file cannot be created
pub fn init_logging() -> Result<LogGuard, LoggingError>
{
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };
    init_console(format, None)
}

/// Initialize logging with an explicit level and format
///
/// `level` overrides `RUST_LOG`. `CRASHCAP_LOG_FILE` is still honored.
///
/// ```rust,no_run
/// use crashcap_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LogGuard, LoggingError>
{
    init_console(format, Some(level.into()))
}

/// Initialize logging to a file only, nothing on stdout or stderr
///
/// With `path = None` the file is [`default_log_path`]. The file is not
/// rotated. Missing parent directories are created.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the file cannot be created.
pub fn init_logging_file_only(
    path: Option<PathBuf>,
    format: LogFormat,
    level: Option<LogLevel>,
) -> Result<(LogGuard, PathBuf), LoggingError>
{
    let path = path.unwrap_or_else(default_log_path);
    let (layer, guard) = file_layer(&path, Rotation::NEVER, format, build_filter(level.map(Into::into)))?;
    Registry::default()
        .with(vec![layer])
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok((LogGuard { file: Some(guard) }, path))
}

/// `~/.crashcap/YYYY-MM-DD-crashcap.log`, or the same name in the temp directory without `HOME`
pub fn default_log_path() -> PathBuf
{
    let file_name = format!("{}-crashcap.log", Utc::now().format("%Y-%m-%d"));
    match env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".crashcap").join(file_name),
        _ => env::temp_dir().join(file_name),
    }
}

fn init_console(format: LogFormat, explicit_level: Option<Level>) -> Result<LogGuard, LoggingError>
{
    let mut layers = vec![fmt_layer(format, io::stderr, true, build_filter(explicit_level))];

    let mut guard = LogGuard::default();
    if let Some(path) = env::var_os(LOG_FILE_ENV).map(PathBuf::from) {
        let (layer, file_guard) = file_layer(&path, Rotation::DAILY, format, build_filter(explicit_level))?;
        layers.push(layer);
        guard.file = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok(guard)
}

/// Filter priority: explicit level, then `RUST_LOG`, then INFO
fn build_filter(explicit_level: Option<Level>) -> EnvFilter
{
    let info = || EnvFilter::default().add_directive(LevelFilter::INFO.into());
    if let Some(level) = explicit_level {
        return EnvFilter::default().add_directive(LevelFilter::from_level(level).into());
    }
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| info()),
        Err(_) => info(),
    }
}

fn file_layer(
    path: &Path,
    rotation: Rotation,
    format: LogFormat,
    filter: EnvFilter,
) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InitializationFailed(format!("{} has no file name", path.display())))?;
    fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file_name.to_string_lossy())
        .build(&dir)
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // No ANSI in files
    Ok((fmt_layer(format, writer, false, filter), guard))
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(ansi);

    match format {
        LogFormat::Pretty => layer.with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// A global subscriber already exists, or the appender could not be built
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(matches!(LogLevel::from_str("loud"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_default_log_path_is_dated()
    {
        let path = default_log_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-crashcap.log"));
        assert!(name.starts_with(&Utc::now().format("%Y-").to_string()));
    }

    #[test]
    fn test_file_layer_creates_parent_directories()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/crashcap.log");
        let (_layer, _guard) = file_layer(&path, Rotation::NEVER, LogFormat::Json, build_filter(None)).unwrap();
        assert!(dir.path().join("logs/nested").is_dir());
    }

    #[test]
    fn test_explicit_level_overrides_environment()
    {
        let filter = build_filter(Some(Level::TRACE));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}
