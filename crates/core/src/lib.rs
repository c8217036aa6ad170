pub mod config;
pub mod crypto_client;
pub mod entry;
mod error;
pub mod job;
pub mod logger;
pub mod orchestrator;
pub mod process_gate;
pub mod progress;
pub mod run_log;
pub mod selection;
pub mod status;
pub mod task;

pub const APP_NAME: &str = "dirsave";

pub use config::{ConfigHandle, ExtensionSet, JobDefinition, Settings};
pub use crypto_client::{CryptoClient, CryptoClientConfig, CryptoLease};
pub use entry::{DirEntry, Entry, FileEntry};
pub use error::{Error, Result};
pub use job::{BackupJob, BackupStrategy, JobState};
pub use logger::{LogLevel, LogRecord, LogSink, MemoryLogSink, TracingLogSink};
pub use orchestrator::{JobOutcome, Orchestrator, RunReport};
pub use process_gate::{GateSignal, ProcessGate};
pub use progress::{EventHub, JobEvent, JobObserver};
pub use selection::resolve_selection;
pub use status::{BackupJobState, JsonStateFile, StateAggregator, StateFileWriter};
pub use task::{BackupTask, TaskContext, TaskKind};
