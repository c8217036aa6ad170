use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::job::{BackupJob, JobState};
use crate::progress::JobEvent;

pub fn state_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state").join("state.json")
}

/// Live progress of one job as observers and the state file see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupJobState {
    pub name: String,
    pub source_file_path: String,
    pub target_file_path: String,
    pub total_files_to_copy: usize,
    pub total_files_size: u64,
    pub nb_files_left_to_do: usize,
    #[serde(default)]
    pub nb_bytes_left_to_do: u64,
    /// Percentage of completed tasks, 0 to 100.
    pub progression: f64,
    pub state: JobState,
}

pub trait StateFileWriter: Send + Sync {
    fn write(&self, states: &[BackupJobState]) -> std::io::Result<()>;
}

/// Durability knobs for the state file. It is rewritten on every progress
/// event from inside the aggregator lock, so both default to off; the rename
/// alone keeps readers from ever seeing a torn file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateWriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl StateWriteOptions {
    pub fn durable() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

/// The state file: a pretty-printed JSON array, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
    options: StateWriteOptions,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: StateWriteOptions::default(),
        }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(state_json_path(data_dir))
    }

    pub fn with_options(mut self, options: StateWriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> StateWriteOptions {
        self.options
    }

    pub fn read(&self) -> std::io::Result<Vec<BackupJobState>> {
        read_state_json(&self.path)
    }
}

impl StateFileWriter for JsonStateFile {
    fn write(&self, states: &[BackupJobState]) -> std::io::Result<()> {
        write_state_json_atomic_with_options(&self.path, states, self.options)
    }
}

pub fn read_state_json(path: &Path) -> std::io::Result<Vec<BackupJobState>> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub fn write_state_json_atomic_with_options(
    path: &Path,
    states: &[BackupJobState],
    options: StateWriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let data = serde_json::to_vec_pretty(states)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&data)?;
    if options.fsync_file {
        f.sync_all()?;
    }
    drop(f);

    std::fs::rename(&tmp, path)?;

    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

struct Tracked {
    state: BackupJobState,
    task_sizes: Vec<u64>,
    completed: usize,
}

impl Tracked {
    fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Started { .. } | JobEvent::Resumed { .. } => {
                self.state.state = JobState::Running;
            }
            JobEvent::Paused { .. } => self.state.state = JobState::Paused,
            JobEvent::Progress { task_index, .. } => {
                let done = task_index + 1;
                if done > self.completed {
                    let bytes: u64 = self.task_sizes[self.completed.min(self.task_sizes.len())
                        ..done.min(self.task_sizes.len())]
                        .iter()
                        .sum();
                    self.completed = done;
                    self.state.nb_bytes_left_to_do =
                        self.state.nb_bytes_left_to_do.saturating_sub(bytes);
                }
                self.state.nb_files_left_to_do =
                    self.state.total_files_to_copy.saturating_sub(self.completed);
                self.state.progression = progression(self.completed, self.state.total_files_to_copy);
            }
            JobEvent::Finished { .. } => self.state.state = JobState::Finished,
            JobEvent::Error { .. } => self.state.state = JobState::Error,
            JobEvent::Cancelled { .. } => self.state.state = JobState::Cancelled,
        }
    }
}

fn progression(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed.min(total) as f64 / total as f64) * 100.0
}

struct AggregatorInner {
    writer: Arc<dyn StateFileWriter>,
    states: Mutex<Vec<Tracked>>,
}

impl AggregatorInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Tracked>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_event(&self, event: &JobEvent) {
        let mut states = self.lock();
        let Some(tracked) = states.iter_mut().find(|t| t.state.name == event.job()) else {
            return;
        };
        tracked.apply(event);
        self.persist(&states);
    }

    /// Called with the lock held so concurrent jobs never interleave writes.
    fn persist(&self, states: &[Tracked]) {
        let snapshot: Vec<BackupJobState> = states.iter().map(|t| t.state.clone()).collect();
        if let Err(e) = self.writer.write(&snapshot) {
            tracing::warn!(event = "state.write_failed", error = %e, "state.write_failed");
        }
    }
}

/// Owns the live per-job states and persists them on every change.
#[derive(Clone)]
pub struct StateAggregator {
    inner: Arc<AggregatorInner>,
}

impl std::fmt::Debug for StateAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAggregator")
            .field("states", &self.states().len())
            .finish()
    }
}

impl StateAggregator {
    pub fn new(writer: Arc<dyn StateFileWriter>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                writer,
                states: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts tracking `job` (replacing any earlier state with the same name)
    /// and keeps the state current from the job's events.
    pub fn create_job_state(&self, job: &BackupJob) -> BackupJobState {
        let task_sizes: Vec<u64> = job.tasks().iter().map(|t| t.transfer_size()).collect();
        let total_bytes: u64 = task_sizes.iter().sum();
        let total = task_sizes.len();

        let state = BackupJobState {
            name: job.name().to_string(),
            source_file_path: job.source().path().display().to_string(),
            target_file_path: job.destination().path().display().to_string(),
            total_files_to_copy: total,
            total_files_size: total_bytes,
            nb_files_left_to_do: total,
            nb_bytes_left_to_do: total_bytes,
            progression: 0.0,
            state: job.state(),
        };

        {
            let mut states = self.inner.lock();
            let tracked = Tracked {
                state: state.clone(),
                task_sizes,
                completed: 0,
            };
            match states.iter_mut().find(|t| t.state.name == state.name) {
                Some(slot) => *slot = tracked,
                None => states.push(tracked),
            }
            self.inner.persist(&states);
        }

        let inner = self.inner.clone();
        job.subscribe(Arc::new(move |event: &JobEvent| inner.on_event(event)));
        state
    }

    pub fn states(&self) -> Vec<BackupJobState> {
        self.inner.lock().iter().map(|t| t.state.clone()).collect()
    }

    pub fn state_of(&self, name: &str) -> Option<BackupJobState> {
        self.inner
            .lock()
            .iter()
            .find(|t| t.state.name == name)
            .map(|t| t.state.clone())
    }

    /// Drops every tracked state, e.g. before a new run set.
    pub fn clear(&self) {
        let mut states = self.inner.lock();
        states.clear();
        self.inner.persist(&states);
    }
}
