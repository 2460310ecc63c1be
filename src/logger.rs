use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// A log line raised by a node, tagged with the node's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

pub trait LoggerType: Send + Sync {
    fn log(&self, record: &LogRecord);
    fn debug_box(&self) -> String;
}

#[derive(Clone)]
pub struct Logger(pub Arc<dyn LoggerType>);

impl Logger {
    pub fn log(&self, record: &LogRecord) {
        self.0.log(record)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger(Arc::new(TracingLogger))
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards node log records to `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl LoggerType for TracingLogger {
    fn log(&self, r: &LogRecord) {
        let name = r.name.as_deref().unwrap_or("");
        match r.level {
            LogLevel::Trace => tracing::trace!(node = %r.id, kind = %r.node_type, name, "{}", r.msg),
            LogLevel::Debug => tracing::debug!(node = %r.id, kind = %r.node_type, name, "{}", r.msg),
            LogLevel::Info => tracing::info!(node = %r.id, kind = %r.node_type, name, "{}", r.msg),
            LogLevel::Warn => tracing::warn!(node = %r.id, kind = %r.node_type, name, "{}", r.msg),
            LogLevel::Error => tracing::error!(node = %r.id, kind = %r.node_type, name, "{}", r.msg),
            LogLevel::Critical => {
                tracing::error!(node = %r.id, kind = %r.node_type, name, "[CRITICAL] {}", r.msg)
            }
        }
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"flowwire=debug"`).
/// - `log_dir`, when given, adds a daily rolling plain-text file `flowwire.log`.
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_tracing(log_level: &str, log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log filter `{log_level}`"))?;
    let stdout_layer = tracing_fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, &dir, "flowwire.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_fmt::layer().with_writer(writer).with_ansi(false);
            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()
                .context("a global subscriber is already installed")?;
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .try_init()
                .context("a global subscriber is already installed")?;
            Ok(None)
        }
    }
}
