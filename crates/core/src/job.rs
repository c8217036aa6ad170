use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobDefinition;
use crate::entry::{DirEntry, Entry, FileEntry};
use crate::logger::{LogRecord, LogSink};
use crate::progress::{EventHub, JobEvent, JobObserver};
use crate::task::{BackupTask, TaskContext};
use crate::{Error, Result};

const CANCELLED_MESSAGE: &str = "stopped by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStrategy {
    /// Empty the destination, then copy the whole source into it.
    FullMirror,
    /// Copy new or modified entries and remove entries the source no longer has.
    Differential,
}

impl BackupStrategy {
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "complete" | "full" | "mirror" => Ok(Self::FullMirror),
            "differential" | "differentielle" | "diff" => Ok(Self::Differential),
            other => Err(Error::InvalidConfig {
                message: format!("unknown backup kind: {other:?}"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullMirror => "full_mirror",
            Self::Differential => "differential",
        }
    }

    /// Computes the tasks that bring `destination` in line with `source`.
    /// Reads the filesystem only.
    pub fn analyze(self, source: &DirEntry, destination: &DirEntry) -> Result<Vec<BackupTask>> {
        if !source.exists() {
            return Err(Error::NotFound {
                path: source.path().to_path_buf(),
            });
        }
        let mut tasks = Vec::new();
        match self {
            Self::FullMirror => {
                if destination.exists() {
                    for entry in sorted_entries(destination)? {
                        tasks.push(BackupTask::remove(entry));
                    }
                }
                for entry in sorted_entries(source)? {
                    let target = counterpart(&entry, destination);
                    tasks.push(BackupTask::copy(entry, target));
                }
            }
            Self::Differential => diff_dirs(source, destination, &mut tasks)?,
        }
        Ok(tasks)
    }
}

fn sorted_entries(dir: &DirEntry) -> Result<Vec<Entry>> {
    let mut entries = dir.entries()?;
    entries.sort_by_key(|e| e.name());
    Ok(entries)
}

/// The entry of the same kind and name as `entry` inside `dir`.
fn counterpart(entry: &Entry, dir: &DirEntry) -> Entry {
    let name = entry.name();
    match entry {
        Entry::File(_) => Entry::File(dir.file(&name)),
        Entry::Directory(_) => Entry::Directory(dir.directory(&name)),
    }
}

fn diff_dirs(source: &DirEntry, destination: &DirEntry, tasks: &mut Vec<BackupTask>) -> Result<()> {
    let destination_exists = destination.exists();

    for entry in sorted_entries(source)? {
        let existing = if destination_exists {
            destination.child(&entry.name())
        } else {
            None
        };

        match (&entry, existing) {
            (_, None) => {
                let target = counterpart(&entry, destination);
                tasks.push(BackupTask::copy(entry, target));
            }
            (Entry::File(src), Some(Entry::File(dst))) => {
                if is_modified(src, &dst)? {
                    tasks.push(BackupTask::copy(entry, Entry::File(dst)));
                }
            }
            (Entry::Directory(src), Some(Entry::Directory(dst))) => {
                diff_dirs(src, &dst, tasks)?;
            }
            (_, Some(mismatched)) => {
                let target = counterpart(&entry, destination);
                tasks.push(BackupTask::remove(mismatched));
                tasks.push(BackupTask::copy(entry, target));
            }
        }
    }

    if destination_exists {
        for entry in sorted_entries(destination)? {
            if !source.contains(&entry) {
                tasks.push(BackupTask::remove(entry));
            }
        }
    }
    Ok(())
}

fn is_modified(source: &FileEntry, destination: &FileEntry) -> Result<bool> {
    Ok(source.name() != destination.name()
        || source.size()? != destination.size()?
        || source.modified()? != destination.modified()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Analyzed,
    Running,
    Paused,
    Finished,
    Cancelled,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Analyzed => "Analyzed",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
            Self::Error => "Error",
        }
    }
}

/// A named backup from one directory to another.
///
/// Cloning is cheap and every clone controls the same job. The task list is
/// fixed by [`BackupJob::analyze`] and then executed in order by the loop that
/// [`BackupJob::run`] spawns. Pause and stop are cooperative: they are observed
/// between tasks, never in the middle of one.
#[derive(Clone)]
pub struct BackupJob {
    inner: Arc<JobInner>,
}

struct JobInner {
    name: String,
    strategy: BackupStrategy,
    source: DirEntry,
    destination: DirEntry,
    tasks: RwLock<Vec<BackupTask>>,
    current_task_index: AtomicUsize,
    state: Mutex<JobState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    events: EventHub,
    ctx: TaskContext,
    log: Arc<dyn LogSink>,
}

impl std::fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupJob")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.strategy)
            .field("source", &self.inner.source)
            .field("destination", &self.inner.destination)
            .field("state", &self.state())
            .finish()
    }
}

impl BackupJob {
    pub fn new(
        name: impl Into<String>,
        strategy: BackupStrategy,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        ctx: TaskContext,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(JobInner {
                name: name.into(),
                strategy,
                source: DirEntry::new(source),
                destination: DirEntry::new(destination),
                tasks: RwLock::new(Vec::new()),
                current_task_index: AtomicUsize::new(0),
                state: Mutex::new(JobState::Created),
                started_at: Mutex::new(None),
                paused,
                cancel: CancellationToken::new(),
                events: EventHub::default(),
                ctx,
                log,
            }),
        }
    }

    pub fn from_definition(
        def: &JobDefinition,
        ctx: TaskContext,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let strategy = BackupStrategy::parse(&def.kind)?;
        Ok(Self::new(
            def.name.clone(),
            strategy,
            &def.source,
            &def.destination,
            ctx,
            log,
        ))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether both handles control the same job.
    pub fn ptr_eq(&self, other: &BackupJob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn strategy(&self) -> BackupStrategy {
        self.inner.strategy
    }

    pub fn source(&self) -> &DirEntry {
        &self.inner.source
    }

    pub fn destination(&self) -> &DirEntry {
        &self.inner.destination
    }

    pub fn state(&self) -> JobState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(JobState::Error)
    }

    pub fn tasks(&self) -> Vec<BackupTask> {
        self.inner
            .tasks
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Index of the next task to execute; equals the number of completed tasks.
    pub fn current_task_index(&self) -> usize {
        self.inner.current_task_index.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.started_at.lock().ok().and_then(|s| *s)
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.inner.events.subscribe(observer);
    }

    /// Builds the task list. Allowed until the job starts running.
    pub async fn analyze(&self) -> Result<usize> {
        let state = self.state();
        if !matches!(state, JobState::Created | JobState::Analyzed) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "job {:?} cannot be analyzed while {}",
                    self.inner.name,
                    state.as_str()
                ),
            });
        }

        let strategy = self.inner.strategy;
        let source = self.inner.source.clone();
        let destination = self.inner.destination.clone();
        let tasks = tokio::task::spawn_blocking(move || strategy.analyze(&source, &destination))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("analyze panicked: {e}"))))??;

        let count = tasks.len();
        if let Ok(mut slot) = self.inner.tasks.write() {
            *slot = tasks;
        }
        self.inner.current_task_index.store(0, Ordering::SeqCst);
        self.transition(|s| {
            matches!(s, JobState::Created | JobState::Analyzed).then_some(JobState::Analyzed)
        });

        tracing::info!(
            event = "job.analyzed",
            job = %self.inner.name,
            strategy = self.inner.strategy.as_str(),
            tasks = count,
            "job.analyzed"
        );
        Ok(count)
    }

    /// Starts executing the analyzed task list and returns a handle resolving
    /// to the terminal state. `Started` is published before this returns.
    pub fn run(&self) -> Result<JoinHandle<JobState>> {
        {
            let mut state = self.inner.state.lock().map_err(|_| poisoned())?;
            if *state != JobState::Analyzed {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "job {:?} cannot run while {}",
                        self.inner.name,
                        state.as_str()
                    ),
                });
            }
            *state = JobState::Running;
        }
        if let Ok(mut started) = self.inner.started_at.lock() {
            *started = Some(Utc::now());
        }

        tracing::info!(event = "job.started", job = %self.inner.name, "job.started");
        self.inner
            .log
            .info(&self.job_record("backup started"));
        self.publish(JobEvent::Started {
            job: self.inner.name.clone(),
        });

        let job = self.clone();
        Ok(tokio::spawn(async move { job.run_loop().await }))
    }

    pub fn pause(&self) {
        let changed = self.transition(|s| (s == JobState::Running).then_some(JobState::Paused));
        if changed {
            self.inner.paused.send_replace(true);
            tracing::info!(event = "job.paused", job = %self.inner.name, "job.paused");
            self.publish(JobEvent::Paused {
                job: self.inner.name.clone(),
            });
        }
    }

    pub fn resume(&self) {
        let changed = self.transition(|s| (s == JobState::Paused).then_some(JobState::Running));
        if changed {
            self.inner.paused.send_replace(false);
            tracing::info!(event = "job.resumed", job = %self.inner.name, "job.resumed");
            self.publish(JobEvent::Resumed {
                job: self.inner.name.clone(),
            });
        }
    }

    /// Requests cancellation. A running job stops before its next task; a job
    /// that never started is cancelled on the spot. No-op once terminal.
    pub fn stop(&self) {
        let never_started = self.transition(|s| {
            matches!(s, JobState::Created | JobState::Analyzed).then_some(JobState::Cancelled)
        });
        if self.state().is_terminal() && !never_started {
            return;
        }
        self.inner.cancel.cancel();
        if never_started {
            self.finish_cancelled();
        }
    }

    fn transition(&self, f: impl FnOnce(JobState) -> Option<JobState>) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        match f(*state) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        }
    }

    fn publish(&self, event: JobEvent) {
        self.inner.events.publish(&event);
    }

    fn job_record(&self, message: &str) -> LogRecord {
        LogRecord {
            source: Some(self.inner.source.path().to_path_buf()),
            destination: Some(self.inner.destination.path().to_path_buf()),
            ..LogRecord::new(self.inner.name.clone(), message)
        }
    }

    async fn run_loop(&self) -> JobState {
        let total = self.task_count();
        loop {
            if self.inner.cancel.is_cancelled() {
                return self.end_cancelled();
            }
            self.wait_while_paused().await;
            if self.inner.cancel.is_cancelled() {
                return self.end_cancelled();
            }

            let index = self.current_task_index();
            if index >= total {
                return self.end_finished();
            }

            let Some(mut task) = self
                .inner
                .tasks
                .read()
                .ok()
                .and_then(|t| t.get(index).cloned())
            else {
                return self.end_error(format!("task {index} is missing"));
            };

            let result = task.execute(&self.inner.ctx).await;
            let record = self.task_record(&task);
            for path in task.encryption_failures() {
                self.inner.log.warning(&LogRecord {
                    destination: Some(path.clone()),
                    encryption_ms: Some(-1),
                    task_kind: Some(task.kind()),
                    ..LogRecord::new(self.inner.name.clone(), "encryption failed")
                });
            }
            if let Ok(mut tasks) = self.inner.tasks.write()
                && let Some(slot) = tasks.get_mut(index)
            {
                *slot = task;
            }

            match result {
                Ok(()) => {
                    self.inner.log.info(&record);
                    self.inner
                        .current_task_index
                        .store(index + 1, Ordering::SeqCst);
                    self.publish(JobEvent::Progress {
                        job: self.inner.name.clone(),
                        task_index: index,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    self.inner.log.error(&LogRecord {
                        message: message.clone(),
                        ..record
                    });
                    return self.end_error(message);
                }
            }
        }
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.inner.paused.subscribe();
        while *rx.borrow_and_update() {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn task_record(&self, task: &BackupTask) -> LogRecord {
        let kind = task.kind();
        LogRecord {
            source: task.source().map(|e| e.path().to_path_buf()),
            destination: task.destination().map(|e| e.path().to_path_buf()),
            size: Some(task.transfer_size()),
            transfer_ms: task
                .duration()
                .and_then(|d| u64::try_from(d.num_milliseconds()).ok()),
            encryption_ms: Some(task.encryption_duration_ms()),
            task_kind: Some(kind),
            ..LogRecord::new(self.inner.name.clone(), format!("{} done", kind.as_str()))
        }
    }

    fn end_finished(&self) -> JobState {
        self.transition(|_| Some(JobState::Finished));
        tracing::info!(event = "job.finished", job = %self.inner.name, "job.finished");
        self.inner.log.info(&self.job_record("backup finished"));
        self.publish(JobEvent::Finished {
            job: self.inner.name.clone(),
        });
        JobState::Finished
    }

    fn end_cancelled(&self) -> JobState {
        self.transition(|_| Some(JobState::Cancelled));
        self.inner.paused.send_replace(false);
        self.finish_cancelled();
        JobState::Cancelled
    }

    fn finish_cancelled(&self) {
        tracing::info!(event = "job.cancelled", job = %self.inner.name, "job.cancelled");
        self.inner.log.warning(&self.job_record(CANCELLED_MESSAGE));
        self.publish(JobEvent::Cancelled {
            job: self.inner.name.clone(),
            message: CANCELLED_MESSAGE.to_string(),
        });
    }

    fn end_error(&self, message: String) -> JobState {
        self.transition(|_| Some(JobState::Error));
        tracing::error!(
            event = "job.failed",
            job = %self.inner.name,
            error = %message,
            "job.failed"
        );
        self.publish(JobEvent::Error {
            job: self.inner.name.clone(),
            message,
        });
        JobState::Error
    }
}

fn poisoned() -> Error {
    Error::Io(std::io::Error::other("job state lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logger::MemoryLogSink;

    fn job_for(src: &std::path::Path, dst: &std::path::Path) -> BackupJob {
        BackupJob::new(
            "job",
            BackupStrategy::Differential,
            src,
            dst,
            TaskContext::default(),
            Arc::new(MemoryLogSink::default()),
        )
    }

    #[test]
    fn parse_accepts_known_kinds_case_insensitively() {
        assert_eq!(BackupStrategy::parse("Complete").unwrap(), BackupStrategy::FullMirror);
        assert_eq!(BackupStrategy::parse("MIRROR").unwrap(), BackupStrategy::FullMirror);
        assert_eq!(
            BackupStrategy::parse("Differentielle").unwrap(),
            BackupStrategy::Differential
        );
        assert_eq!(BackupStrategy::parse(" diff ").unwrap(), BackupStrategy::Differential);
        assert!(matches!(
            BackupStrategy::parse("snapshot"),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn analyze_requires_an_existing_source() {
        let dst = tempfile::tempdir().unwrap();
        let missing = DirEntry::new(dst.path().join("nope"));
        let err = BackupStrategy::FullMirror
            .analyze(&missing, &DirEntry::new(dst.path()))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn run_before_analyze_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let job = job_for(src.path(), dst.path());
        assert!(matches!(job.run(), Err(Error::InvalidConfig { .. })));
        assert_eq!(job.state(), JobState::Created);
    }

    #[tokio::test]
    async fn stop_before_run_cancels_once_and_blocks_run() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let job = job_for(src.path(), dst.path());
        job.analyze().await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        job.subscribe(Arc::new(move |e: &JobEvent| sink.lock().unwrap().push(e.clone())));

        job.stop();
        job.stop();
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(job.run().is_err());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], JobEvent::Cancelled { .. }));
    }

    #[tokio::test]
    async fn pause_is_ignored_unless_running() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let job = job_for(src.path(), dst.path());
        job.pause();
        assert!(!job.is_paused());
        assert_eq!(job.state(), JobState::Created);
    }

    #[tokio::test]
    async fn empty_job_starts_and_finishes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let job = job_for(src.path(), dst.path());
        assert_eq!(job.analyze().await.unwrap(), 0);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        job.subscribe(Arc::new(move |e: &JobEvent| sink.lock().unwrap().push(e.clone())));

        let state = job.run().unwrap().await.unwrap();
        assert_eq!(state, JobState::Finished);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                JobEvent::Started { job: "job".to_string() },
                JobEvent::Finished { job: "job".to_string() },
            ]
        );
    }
}
