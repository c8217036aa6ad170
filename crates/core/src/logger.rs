use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use crate::task::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// One structured log entry about a job or one of its tasks.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub job: String,
    pub message: String,
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub size: Option<u64>,
    pub transfer_ms: Option<u64>,
    pub encryption_ms: Option<i64>,
    pub task_kind: Option<TaskKind>,
}

impl LogRecord {
    pub fn new(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            message: message.into(),
            ..Self::default()
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, record: &LogRecord);

    fn info(&self, record: &LogRecord) {
        self.log(LogLevel::Info, record)
    }

    fn warning(&self, record: &LogRecord) {
        self.log(LogLevel::Warning, record)
    }

    fn error(&self, record: &LogRecord) {
        self.log(LogLevel::Error, record)
    }

    fn critical(&self, record: &LogRecord) {
        self.log(LogLevel::Critical, record)
    }
}

/// Forwards records to `tracing`, which routes them to the daily NDJSON log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, record: &LogRecord) {
        let source = record.source.as_ref().map(|p| p.display().to_string());
        let destination = record.destination.as_ref().map(|p| p.display().to_string());
        let task_kind = record.task_kind.map(|k| k.as_str());

        macro_rules! emit {
            ($mac:ident, $event:literal) => {
                tracing::$mac!(
                    event = $event,
                    job = %record.job,
                    detail = %record.message,
                    source = source.as_deref(),
                    destination = destination.as_deref(),
                    size = record.size,
                    transfer_ms = record.transfer_ms,
                    encryption_ms = record.encryption_ms,
                    task_kind,
                    $event
                )
            };
        }

        match level {
            LogLevel::Info => emit!(info, "job.log"),
            LogLevel::Warning => emit!(warn, "job.log"),
            LogLevel::Error => emit!(error, "job.log"),
            LogLevel::Critical => emit!(error, "job.log_critical"),
        }
    }
}

/// Keeps records in memory; handy for tests and for surfaces that render the
/// latest log lines.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<(LogLevel, LogRecord)>>,
}

impl MemoryLogSink {
    pub fn records(&self) -> Vec<(LogLevel, LogRecord)> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, record: &LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push((level, record.clone()));
        }
    }
}
