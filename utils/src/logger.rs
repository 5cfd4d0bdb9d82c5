use once_cell::sync::OnceCell;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_log::LogTracer;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

// Hold the non-blocking writer guard to keep the background logging thread alive
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

// Logger initialization flag
static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

const DEFAULT_APP_LOG_LEVEL: &str = "info,engine=debug,hyper=warn,h2=warn,reqwest=warn";

/// Logger configuration structure
///
/// # Examples
///
/// Basic usage with console and file output:
/// ```ignore
/// use std::path::PathBuf;
/// use utils::logger::LoggerConfig;
///
/// let config = LoggerConfig::new()
///     .with_level("debug")
///     .with_file_path(PathBuf::from("./logs/conveyor.log"))
///     .with_console(true);
/// ```
#[derive(Debug)]
pub struct LoggerConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Optional file path for system log output
    pub file_path: Option<PathBuf>,
    /// Whether to enable console output
    pub enable_console: bool,
    /// Whether to use JSON format for logs
    pub json_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "error".to_string(),
            file_path: Some(PathBuf::from("./logs/conveyor.log")),
            enable_console: true,
            json_format: false,
        }
    }
}

impl LoggerConfig {
    /// Initialize the logger with this configuration
    pub async fn init(self) -> Result<(), Box<dyn std::error::Error>> {
        init_logger(self).await
    }

    /// Create a new logger configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn with_level(mut self, level: impl AsRef<str>) -> Self {
        self.level = level.as_ref().into();
        self
    }

    /// Set the file path for system log output
    pub fn with_file_path(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enable: bool) -> Self {
        self.enable_console = enable;
        self
    }

    /// Enable or disable JSON format
    pub fn with_json(mut self, enable: bool) -> Self {
        self.json_format = enable;
        self
    }

    /// Create a practical app config using namespace-based file name.
    pub fn for_app(namespace: &str) -> Self {
        Self {
            level: DEFAULT_APP_LOG_LEVEL.to_string(),
            file_path: Some(PathBuf::from("logs").join(format!("conveyor.{namespace}"))),
            enable_console: true,
            json_format: false,
        }
    }
}

/// Logging is always enabled when configured via TOML.
pub fn is_logging_disabled() -> bool {
    let value = env::var("DISABLE_LOGS")
        .or_else(|_| env::var("CONVEYOR_DISABLE_LOGS"))
        .unwrap_or_default();
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Initialize logger with sensible defaults and env overrides.
/// Returns Ok(true) if enabled, Ok(false) if disabled by env.
pub async fn init_app_logger(namespace: &str) -> Result<bool, Box<dyn std::error::Error>> {
    if is_logging_disabled() {
        return Ok(false);
    }

    let config = LoggerConfig::for_app(namespace);
    init_logger(config).await?;
    Ok(true)
}

/// Initialize and configure tracing logger
pub async fn init_logger(config: LoggerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if is_logging_disabled() {
        // Mark initialized to avoid repeated attempts when logging is disabled.
        let _ = LOGGER_INITIALIZED.swap(true, Ordering::SeqCst);
        return Ok(());
    }
    if LOGGER_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::warn!("Logger already initialized, skipping re-initialization");
        return Ok(());
    }

    // bridge log crate
    let _ = LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init();

    let default_level = config.level.to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // timer
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(local_offset, Rfc3339);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    // prepare optional console layer
    if config.enable_console {
        if config.json_format {
            layers.push(fmt::layer().json().with_timer(timer.clone()).boxed());
        } else {
            // Use compact formatting for cleaner/faster console output
            layers.push(
                fmt::layer()
                    .compact()
                    .with_target(false) // Hide module path to reduce noise
                    .with_thread_ids(true)
                    .with_timer(timer.clone())
                    .boxed(),
            );
        }
    }

    // prepare optional system log file layer
    if let Some(file_path) = config.file_path {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_path_prefix = file_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "conveyor".to_string());
        let file_appender = tracing_appender::rolling::Builder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(file_path_prefix)
            .filename_suffix("log")
            .build(
                file_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new(".")),
            )?;

        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        let _ = FILE_GUARD.set(guard);

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_timer(timer.clone())
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_timer(timer.clone())
                .boxed()
        };
        layers.push(layer);
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    Ok(())
}

/// Initialize a simple logger with default configuration
/// Useful for quick setup in development or testing environments
pub async fn init_simple_logger() -> Result<(), Box<dyn std::error::Error>> {
    let config = LoggerConfig::default();
    init_logger(config).await
}
