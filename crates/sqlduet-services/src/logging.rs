//! Logging initialisation
//!
//! Builds a `tracing-subscriber` registry with a pretty console layer and an
//! optional JSON file layer rotated daily. `RUST_LOG` takes precedence over
//! the configured filter.

use anyhow::Context;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const CRATE_FILTERS: &[&str] = &[
    "sqlduet_core",
    "sqlduet_drivers",
    "sqlduet_driver_sqlite",
    "sqlduet_driver_postgres",
    "sqlduet_connection",
    "sqlduet_query",
    "sqlduet_schema",
    "sqlduet_services",
];

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for the JSON log files
    pub log_dir: PathBuf,

    pub enable_json_logs: bool,

    pub enable_console_logs: bool,

    /// Include file/line information in console output
    pub include_location: bool,

    /// Log span open/close events (for timing async operations)
    pub enable_spans: bool,

    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl LoggingConfig {
    /// Verbose console output plus JSON files
    pub fn development() -> Self {
        Self {
            log_dir: log_directory(),
            enable_json_logs: true,
            enable_console_logs: true,
            include_location: cfg!(debug_assertions),
            enable_spans: cfg!(debug_assertions),
            default_filter: filter_for("warn", "debug"),
        }
    }

    /// JSON files only, at info level
    pub fn production() -> Self {
        Self {
            log_dir: log_directory(),
            enable_json_logs: true,
            enable_console_logs: false,
            include_location: false,
            enable_spans: false,
            default_filter: filter_for("warn", "info"),
        }
    }

    /// Console only, no files
    pub fn testing() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("sqlduet-tests"),
            enable_json_logs: false,
            enable_console_logs: true,
            include_location: true,
            enable_spans: true,
            default_filter: "debug".to_string(),
        }
    }
}

fn filter_for(global: &str, ours: &str) -> String {
    let mut filter = global.to_string();
    for target in CRATE_FILTERS {
        filter.push_str(&format!(",{}={}", target, ours));
    }
    filter
}

/// Default log directory: `<local data dir>/sqlduet/logs`
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sqlduet")
        .join("logs")
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the program. Fails if a global subscriber is already set.
pub fn init(config: LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    // NEW fires once per span; ENTER would repeat on every re-poll of an awaited future
    let span_events = if config.enable_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();
    let mut guard = None;

    if config.enable_console_logs {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events.clone())
            .with_ansi(true)
            .pretty()
            .with_filter(env_filter(&config)?)
            .boxed();
        layers.push(console_layer);
    }

    if config.enable_json_logs {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

        let file_appender = tracing_appender::rolling::daily(&config.log_dir, "sqlduet.log");
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let json_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(span_events)
            .with_ansi(false)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(non_blocking)
            .with_filter(env_filter(&config)?)
            .boxed();
        layers.push(json_layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        log_dir = %config.log_dir.display(),
        json_enabled = config.enable_json_logs,
        console_enabled = config.enable_console_logs,
        "logging initialized"
    );

    Ok(guard)
}

/// Each layer gets its own filter instance
fn env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .with_context(|| format!("Invalid log filter '{}'", config.default_filter))
}

/// Initialize with the development preset in debug builds and production otherwise
pub fn init_default() -> anyhow::Result<Option<WorkerGuard>> {
    let config = if cfg!(debug_assertions) {
        LoggingConfig::development()
    } else {
        LoggingConfig::production()
    };
    init(config)
}
