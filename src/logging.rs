//! Process-wide `tracing` setup for the binary.
//!
//! Console output goes through `fmt` with an `EnvFilter`; `RUST_LOG` wins over
//! the configured level. With `logging.file` set, a second layer writes JSON
//! lines to a daily-rolled file through a non-blocking appender. The returned
//! guard must outlive the run or buffered lines are lost.

use crate::config::LoggingConfig;
use crate::error::{Result, VrError};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Keeps the file writer alive; flushes on drop.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LoggingGuard {
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

fn filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| VrError::config(format!("logging.level: {e}"))),
    }
}

/// Installs the global subscriber. `level_override` comes from the command
/// line and replaces `config.level`.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<LoggingGuard> {
    let level = level_override.unwrap_or(&config.level);
    let mut layers = Vec::new();

    let console = tracing_subscriber::fmt::layer().with_target(true);
    let console = if config.json {
        console.json().with_filter(filter(level)?).boxed()
    } else {
        console.with_filter(filter(level)?).boxed()
    };
    layers.push(console);

    let mut file_guard = None;
    let mut log_file = None;
    if let Some(path) = &config.file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| VrError::config(format!("logging.file {} has no file name", path.display())))?;
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(filter(level)?)
                .boxed(),
        );
        file_guard = Some(guard);
        log_file = Some(path.clone());
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| VrError::config(format!("logging already initialized: {e}")))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        log_file,
    })
}
