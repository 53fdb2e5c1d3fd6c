//! Logging system configuration and initialization
//!
//! Console and file output over tracing, with log level control from the
//! configuration file and JST (the catalog's timezone, UTC+9) timestamps.
//! The previous log file is rotated aside with a timestamp on startup.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{FixedOffset, Utc};
use lazy_static::lazy_static;
use std::sync::Mutex;
use tracing_appender::non_blocking;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::infrastructure::config::{ConfigManager, LoggingConfig};

const LOG_FILE_NAME: &str = "carton-crawler.log";

// Keeps the non-blocking writer alive for the process lifetime
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Time formatter for JST (UTC+9)
struct JstTimeFormatter;

impl FormatTime for JstTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let jst_offset = FixedOffset::east_opt(9 * 3600).expect("valid JST offset");
        let jst_time = Utc::now().with_timezone(&jst_offset);
        write!(w, "{}", jst_time.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Log directory under the application data directory
pub fn get_log_directory() -> PathBuf {
    ConfigManager::get_app_data_dir()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

/// Move an existing log file aside, stamped with its modification time
fn rotate_existing_log_file(log_dir: &PathBuf) -> Result<()> {
    let log_file_path = log_dir.join(LOG_FILE_NAME);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to read log file metadata: {e}"))?;
    let file_time = metadata
        .modified()
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let datetime: chrono::DateTime<Utc> = file_time.into();
    let jst = datetime.with_timezone(&FixedOffset::east_opt(9 * 3600).expect("valid JST offset"));

    let stem = LOG_FILE_NAME.trim_end_matches(".log");
    let rotated = log_dir.join(format!("{}.{}.log", stem, jst.format("%Y%m%dT%H%M%S")));
    std::fs::rename(&log_file_path, &rotated)
        .map_err(|e| anyhow!("Failed to rotate log file: {e}"))?;
    Ok(())
}

/// Build the level filter from the configured default and module filters
fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let mut directives = config.level.clone();
    for (module, level) in &config.module_filters {
        directives.push_str(&format!(",{module}={level}"));
    }
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize console and file logging per configuration. Safe to call
/// once per process.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(config);

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_timer(JstTimeFormatter)
            .with_target(true)
            .with_ansi(true)
    });

    let file_layer = if config.file_output {
        let log_dir = get_log_directory();
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory: {e}"))?;
        rotate_existing_log_file(&log_dir)?;

        let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME);
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .expect("log guard lock poisoned")
            .push(guard);

        Some(
            fmt::layer()
                .with_timer(JstTimeFormatter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer),
        )
    } else {
        None
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    tracing::info!(level = %config.level, "logging initialized");
    Ok(())
}
