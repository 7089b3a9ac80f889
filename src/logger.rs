use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use unit_plugin::message::LogLevel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the daily rolling log inside `log_dir`.
    pub file_name: String,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>, file_name: impl Into<String>) -> Self {
        Self { log_level, log_dir, file_name: file_name.into() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: LogLevel::Info, log_dir: None, file_name: "autorc.log".to_string() }
    }
}

pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn tracing() -> Self {
        Logger(Box::new(TracingLogger))
    }

    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }

    pub fn into_inner(self) -> Box<dyn LoggerType> {
        self.0
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards to the globally installed `tracing` subscriber.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// One recorded line of a [`MemoryLogger`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub context: String,
    pub message: String,
}

/// Keeps every line in memory; clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn logger(&self) -> Logger {
        Logger(Box::new(self.clone()))
    }
}

impl LoggerType for MemoryLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry { level, context: context.to_string(), message: msg.to_string() });
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MemoryLogger({} entries)", self.entries().len())
    }
}

/// Keeps the background file writer alive; drop it last.
pub struct LogGuard(#[allow(dead_code)] Option<WorkerGuard>);

/// Install the global subscriber: a stderr layer, plus a daily rolling file when
/// `log_dir` is set. `RUST_LOG` wins over the configured level.
///
/// Stdout is never written to, units use it for their control protocol.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<(Logger, LogGuard)> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("could not install tracing subscriber: {e}"))?;

    Ok((Logger::tracing(), LogGuard(guard)))
}
