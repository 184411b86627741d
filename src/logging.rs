//! Logging setup shared by the pool process and its workers.
//!
//! Everything goes to stderr: in a worker, stdout is the IPC channel.
//!
//! # Environment Variables
//!
//! - `PROCPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use procpool::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// Single file
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN for the CLI, so results stay readable)
    pub level: Level,
    pub format: LogFormat,
    /// Optional log file, written in addition to stderr
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    /// Thread names identify the pool loops (`procpool-scheduler`, ...)
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_names: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for worker processes: compact lines, no file output, so many
    /// workers never rotate the same file.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_thread_names: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter or file already set from the command line wins over the
    /// environment.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("PROCPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCPOOL_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if self.file_path.is_none()
            && let Ok(path) = std::env::var("PROCPOOL_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("procpool.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr and, if `file_path` is set, to a rolling file as well.
/// Later calls are ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.fmt_layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.fmt_layer(file_appender(path, config.rotation), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!(
            "hourly".parse::<LogRotation>().unwrap(),
            LogRotation::Hourly
        );
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker();
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.file_path.is_none());
        assert_eq!(config.level, Level::WARN);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with every other env-mutating test
        unsafe {
            std::env::set_var("PROCPOOL_LOG_FORMAT", "json");
            std::env::set_var("PROCPOOL_LOG_LEVEL", "debug");
            std::env::set_var("PROCPOOL_LOG_FILE", "/tmp/procpool-test.log");
            std::env::remove_var("PROCPOOL_LOG");
            std::env::remove_var("RUST_LOG");
        }

        let config = LogConfig::new().with_env_overrides();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/procpool-test.log"))
        );

        // Command-line values win
        let config = LogConfig::new()
            .with_filter("procpool=trace".into())
            .with_file(PathBuf::from("/tmp/cli.log"))
            .with_env_overrides();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/cli.log")));

        unsafe {
            std::env::remove_var("PROCPOOL_LOG_FORMAT");
            std::env::remove_var("PROCPOOL_LOG_LEVEL");
            std::env::remove_var("PROCPOOL_LOG_FILE");
        }
    }

    #[test]
    #[serial]
    fn test_procpool_log_beats_rust_log() {
        unsafe {
            std::env::set_var("PROCPOOL_LOG", "procpool=debug");
            std::env::set_var("RUST_LOG", "error");
        }
        let config = LogConfig::new().with_env_overrides();
        assert_eq!(config.filter.as_deref(), Some("procpool=debug"));
        unsafe {
            std::env::remove_var("PROCPOOL_LOG");
            std::env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_init_with_file_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.log");
        init(
            LogConfig::new()
                .with_filter("procpool=info".into())
                .with_rotation(LogRotation::Never)
                .with_file(path.clone()),
        );
        tracing::info!(target: "procpool", "file logging works");

        // Only the first init in this test binary wins; if another test got
        // there first the file may be empty.
        if let Ok(contents) = std::fs::read_to_string(&path) {
            assert!(contents.is_empty() || contents.contains("file logging works"));
        }
    }
}
