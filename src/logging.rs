//! Structured logging and tracing for Sinapsi
//!
//! Diagnostics go to stderr and to a daily rolling file; stdout is reserved
//! for the outbound message stream. Components log through a
//! [`StructuredLogger`] that prefixes every line with its component fields.

mod level;
mod structured;

pub use level::{level_rank, min_level, parse_log_level};
pub use structured::{LogContext, StructuredLogger, get_logger, get_logger_with_context};

use crate::config::LoggingConfig;
use crate::error::{Result, SinapsiError};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{Level, info};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

// The file writer flushes only while its guard is alive
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Effective per-sink levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SinkLevels {
    console: Level,
    file: Level,
}

impl SinkLevels {
    /// Sink overrides fall back to the base level when absent or invalid
    fn resolve(config: &LoggingConfig) -> Result<Self> {
        let base = parse_log_level(&config.level)?;
        let pick = |o: &Option<String>| {
            o.as_deref()
                .and_then(|s| parse_log_level(s).ok())
                .unwrap_or(base)
        };
        Ok(Self {
            console: pick(&config.console_level),
            file: pick(&config.file_level),
        })
    }

    fn most_verbose(self) -> Level {
        min_level(self.console, self.file)
    }
}

/// Initialize logging once per process; later calls return the first outcome
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        if let Err(e) = install(config) {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    match INIT_ERROR.get() {
        Some(err) => Err(SinapsiError::config(err.clone())),
        None => Ok(()),
    }
}

fn install(config: &LoggingConfig) -> Result<()> {
    let levels = SinkLevels::resolve(config)?;
    let console_only = cfg!(test) || std::env::var_os("SINAPSI_DISABLE_FILE_LOG").is_some();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if console_only || config.console_output {
        layers.push(stderr_layer(config.json_format, levels.console));
    }
    if !console_only {
        let (writer, guard) = rolling_writer(config)?;
        let _ = LOG_GUARD.set(guard);
        layers.push(file_layer(writer, config.json_format, levels.file));
    }

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(levels.most_verbose()))
        .try_init();

    match installed {
        Ok(()) => {
            info!(
                "Logging initialized - console_level: {:?}, file_level: {:?}, file: {}",
                levels.console,
                levels.file,
                if console_only { "<disabled>" } else { config.file.as_str() }
            );
            Ok(())
        }
        // Another subscriber in the same test binary is fine
        Err(_) if console_only => Ok(()),
        Err(e) => Err(SinapsiError::config(format!(
            "Failed to install subscriber: {}",
            e
        ))),
    }
}

/// `RUST_LOG` wins over the configured level
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sinapsi={},tokio_modbus=warn", level).into())
}

fn stderr_layer(json: bool, level: Level) -> BoxedLayer {
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    if json {
        base.json().with_filter(LevelFilter::from_level(level)).boxed()
    } else {
        base.with_filter(LevelFilter::from_level(level)).boxed()
    }
}

fn file_layer(writer: NonBlocking, json: bool, level: Level) -> BoxedLayer {
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    if json {
        base.json().with_filter(LevelFilter::from_level(level)).boxed()
    } else {
        base.with_filter(LevelFilter::from_level(level)).boxed()
    }
}

/// Directory receiving the rotated files: the parent of a file path, or the path itself
fn log_directory(file: &str) -> PathBuf {
    let path = Path::new(file);
    match path.parent() {
        Some(parent) if path.extension().is_some() => parent.to_path_buf(),
        _ => path.to_path_buf(),
    }
}

fn rolling_writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    let appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("sinapsi")
        .filename_suffix("log")
        .max_log_files(config.backup_count.max(1) as usize)
        .build(log_directory(&config.file))
        .map_err(|e| SinapsiError::io(format!("Failed to create log file appender: {}", e)))?;
    Ok(tracing_appender::non_blocking(appender))
}
