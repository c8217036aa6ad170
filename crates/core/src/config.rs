use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::job::BackupStrategy;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub crypto: CryptoSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSettings {
    /// Worker executable, spawned when no worker process is running.
    pub executable: String,
    /// Local socket the worker listens on.
    pub socket_path: String,
    pub key: String,
    pub extensions: Vec<String>,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub priority_extensions: Vec<String>,
    pub max_concurrent_jobs: usize,
    /// Files above this size (KiB) are copied one at a time across jobs. 0 disables the limit.
    pub max_concurrent_size_kb: u64,
    pub process_blacklist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub kind: String,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            executable: "dirsave-crypto-worker".to_string(),
            socket_path: std::env::temp_dir()
                .join("dirsave-crypto.sock")
                .to_string_lossy()
                .into_owned(),
            key: String::new(),
            extensions: Vec::new(),
            connect_timeout_ms: 5_000,
            response_timeout_ms: 60_000,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            priority_extensions: Vec::new(),
            max_concurrent_jobs: 3,
            max_concurrent_size_kb: 0,
            process_blacklist: Vec::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            crypto: CryptoSettings::default(),
            scheduler: SchedulerSettings::default(),
            jobs: Vec::new(),
        }
    }
}

impl CryptoSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl SchedulerSettings {
    pub fn large_file_threshold_bytes(&self) -> Option<u64> {
        (self.max_concurrent_size_kb > 0).then(|| self.max_concurrent_size_kb.saturating_mul(1024))
    }
}

/// Normalised set of file extensions: lowercase, no leading dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet(HashSet<String>);

impl ExtensionSet {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.0
            .contains(&extension.trim_start_matches('.').to_lowercase())
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|e| self.contains(&e.to_string_lossy()))
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.scheduler.max_concurrent_jobs == 0 {
        return Err(Error::InvalidConfig {
            message: "scheduler.max_concurrent_jobs must be >= 1".to_string(),
        });
    }

    if !settings.crypto.extensions.is_empty() {
        if settings.crypto.executable.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "crypto.executable must not be empty when crypto.extensions is set"
                    .to_string(),
            });
        }
        if settings.crypto.socket_path.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "crypto.socket_path must not be empty when crypto.extensions is set"
                    .to_string(),
            });
        }
    }

    for (i, job) in settings.jobs.iter().enumerate() {
        validate_job_definition(job)?;
        if let Some(dup) = settings.jobs[..i]
            .iter()
            .find(|other| is_duplicate(other, job))
        {
            return Err(duplicate_error(dup, job));
        }
    }

    Ok(())
}

fn validate_job_definition(job: &JobDefinition) -> Result<()> {
    if job.name.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "jobs[].name must not be empty".to_string(),
        });
    }
    if job.source.trim().is_empty() || job.destination.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: format!(
                "jobs[].source and jobs[].destination must not be empty (job={})",
                job.name
            ),
        });
    }
    BackupStrategy::parse(&job.kind)?;
    Ok(())
}

fn is_duplicate(a: &JobDefinition, b: &JobDefinition) -> bool {
    a.name == b.name
        || (a.source == b.source
            && a.destination == b.destination
            && a.kind.eq_ignore_ascii_case(&b.kind))
}

fn duplicate_error(existing: &JobDefinition, new: &JobDefinition) -> Error {
    let message = if existing.name == new.name {
        format!("a job named {:?} already exists", new.name)
    } else {
        format!(
            "job {:?} already backs up {} to {} ({})",
            existing.name, existing.source, existing.destination, existing.kind
        )
    };
    Error::DuplicateJob { message }
}

/// Appends `job` after checking it against the existing job list.
pub fn add_job(settings: &mut Settings, job: JobDefinition) -> Result<()> {
    validate_job_definition(&job)?;
    if let Some(existing) = settings.jobs.iter().find(|other| is_duplicate(other, &job)) {
        return Err(duplicate_error(existing, &job));
    }
    settings.jobs.push(job);
    Ok(())
}

pub fn remove_job(settings: &mut Settings, name: &str) -> Result<JobDefinition> {
    let pos = settings
        .jobs
        .iter()
        .position(|j| j.name == name)
        .ok_or_else(|| Error::JobNotFound {
            selector: name.to_string(),
        })?;
    Ok(settings.jobs.remove(pos))
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Shared, observable configuration. Readers take an immutable snapshot; edits
/// publish a new value to every subscriber.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Self {
        let (tx, _) = watch::channel(Arc::new(settings));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    pub fn update(&self, settings: Settings) -> Result<()> {
        validate_settings(&settings)?;
        self.tx.send_replace(Arc::new(settings));
        tracing::info!(event = "config.changed", "config.changed");
        Ok(())
    }
}
