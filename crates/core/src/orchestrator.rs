use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::{ConfigHandle, ExtensionSet, Settings};
use crate::crypto_client::{CryptoClient, CryptoClientConfig};
use crate::job::{BackupJob, JobState};
use crate::logger::{LogRecord, LogSink, TracingLogSink};
use crate::process_gate::ProcessGate;
use crate::progress::{EventHub, JobEvent, JobObserver};
use crate::selection::resolve_selection;
use crate::status::StateAggregator;
use crate::task::TaskContext;
use crate::{Error, Result};

/// Terminal state of one job in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub name: String,
    pub priority: bool,
    pub state: JobState,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    /// In selection order.
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn all_finished(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == JobState::Finished)
    }

    pub fn outcome(&self, name: &str) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Runs selections of configured jobs: priority jobs first, each pool bounded
/// by `scheduler.max_concurrent_jobs`.
#[derive(Clone)]
pub struct Orchestrator {
    config: ConfigHandle,
    aggregator: StateAggregator,
    gate: ProcessGate,
    log: Arc<dyn LogSink>,
    events: Arc<EventHub>,
    crypto: Option<Arc<CryptoClient>>,
    large_transfer_gate: Arc<Semaphore>,
    active: Arc<Mutex<Vec<BackupJob>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active_jobs", &self.active_jobs().len())
            .field("gate_blocked", &self.gate.is_blocked())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: ConfigHandle, aggregator: StateAggregator) -> Self {
        Self {
            config,
            aggregator,
            gate: ProcessGate::new(),
            log: Arc::new(TracingLogSink),
            events: Arc::new(EventHub::default()),
            crypto: None,
            large_transfer_gate: Arc::new(Semaphore::new(1)),
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn with_process_gate(mut self, gate: ProcessGate) -> Self {
        self.gate = gate;
        self
    }

    /// Shares one crypto client across runs instead of building one per run
    /// from the `[crypto]` settings.
    pub fn with_crypto_client(mut self, client: Arc<CryptoClient>) -> Self {
        self.crypto = Some(client);
        self
    }

    pub fn process_gate(&self) -> &ProcessGate {
        &self.gate
    }

    pub fn aggregator(&self) -> &StateAggregator {
        &self.aggregator
    }

    /// Receives the events of every job this orchestrator runs.
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        self.events.subscribe(observer);
    }

    pub fn active_jobs(&self) -> Vec<BackupJob> {
        self.lock_active().clone()
    }

    pub fn pause_all(&self) {
        for job in self.active_jobs() {
            job.pause();
        }
    }

    pub fn resume_all(&self) {
        for job in self.active_jobs() {
            job.resume();
        }
    }

    pub fn stop_all(&self) {
        for job in self.active_jobs() {
            job.stop();
        }
    }

    /// Pauses every active job while the process gate is blocked and resumes
    /// them once it clears.
    pub fn watch_process_gate(&self) -> JoinHandle<()> {
        let mut rx = self.gate.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let blocked = *rx.borrow_and_update();
                if blocked {
                    tracing::info!(event = "gate.pause_all", "gate.pause_all");
                    this.pause_all();
                } else {
                    tracing::info!(event = "gate.resume_all", "gate.resume_all");
                    this.resume_all();
                }
            }
        })
    }

    /// Resolves `selection`, builds every job, then runs them. Nothing starts
    /// when the selection or any job definition is invalid.
    pub async fn run(&self, selection: &str) -> Result<RunReport> {
        let settings = self.config.snapshot();
        let indices = resolve_selection(selection, &settings.jobs)?;
        let ctx = self.task_context(&settings)?;

        let mut jobs = Vec::with_capacity(indices.len());
        for index in indices {
            let job = BackupJob::from_definition(&settings.jobs[index], ctx.clone(), self.log.clone())?;
            job.subscribe(self.events.clone());
            jobs.push(job);
        }

        let priority_extensions = ExtensionSet::new(&settings.scheduler.priority_extensions);
        let mut classified = Vec::with_capacity(jobs.len());
        for job in jobs {
            let priority = if priority_extensions.is_empty() {
                false
            } else {
                let source = job.source().path().to_path_buf();
                let extensions = priority_extensions.clone();
                tokio::task::spawn_blocking(move || has_priority_file(&source, &extensions))
                    .await
                    .unwrap_or(false)
            };
            tracing::debug!(event = "job.classified", job = %job.name(), priority, "job.classified");
            classified.push((job, priority));
        }

        self.lock_active()
            .extend(classified.iter().map(|(job, _)| job.clone()));

        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let priority_count = classified.iter().filter(|(_, p)| *p).count();
        tracing::info!(
            event = "run.start",
            run_id = %run_id,
            jobs = classified.len(),
            priority_jobs = priority_count,
            "run.start"
        );

        let limit = settings.scheduler.max_concurrent_jobs.max(1);
        let priority_pool = Arc::new(Semaphore::new(limit));
        let normal_pool = Arc::new(Semaphore::new(limit));
        let (priority_done_tx, priority_done_rx) = watch::channel(priority_count == 0);

        let mut priority_handles = Vec::new();
        let mut normal_handles = Vec::new();
        for (position, (job, priority)) in classified.iter().enumerate() {
            let driver = Driver {
                job: job.clone(),
                priority: *priority,
                aggregator: self.aggregator.clone(),
                gate: self.gate.clone(),
                log: self.log.clone(),
            };
            if *priority {
                let handle = tokio::spawn(driver.drive(priority_pool.clone(), None));
                priority_handles.push((position, handle));
            } else {
                let wait = Some(priority_done_rx.clone());
                let handle = tokio::spawn(driver.drive(normal_pool.clone(), wait));
                normal_handles.push((position, handle));
            }
        }

        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; classified.len()];
        for (position, handle) in priority_handles {
            outcomes[position] = Some(join_outcome(handle, &classified[position]).await);
        }
        priority_done_tx.send_replace(true);
        for (position, handle) in normal_handles {
            outcomes[position] = Some(join_outcome(handle, &classified[position]).await);
        }

        self.lock_active()
            .retain(|active| !classified.iter().any(|(job, _)| job.ptr_eq(active)));

        let report = RunReport {
            run_id,
            outcomes: outcomes.into_iter().flatten().collect(),
        };
        tracing::info!(
            event = "run.finish",
            run_id = %report.run_id,
            jobs = report.outcomes.len(),
            all_finished = report.all_finished(),
            "run.finish"
        );
        Ok(report)
    }

    fn task_context(&self, settings: &Settings) -> Result<TaskContext> {
        let crypto_extensions = ExtensionSet::new(&settings.crypto.extensions);
        let crypto = match &self.crypto {
            Some(client) => Some(client.clone()),
            None if crypto_extensions.is_empty() => None,
            None => {
                if settings.crypto.key.is_empty() {
                    return Err(Error::InvalidConfig {
                        message: "crypto.key must be set when crypto.extensions is set".to_string(),
                    });
                }
                Some(Arc::new(CryptoClient::new(CryptoClientConfig::from_settings(
                    &settings.crypto,
                ))))
            }
        };
        Ok(TaskContext {
            crypto,
            crypto_extensions,
            large_file_threshold: settings.scheduler.large_file_threshold_bytes(),
            large_transfer_gate: self.large_transfer_gate.clone(),
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, Vec<BackupJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether any file below `source` has one of `extensions`. Scan errors count as no.
pub fn has_priority_file(source: &Path, extensions: &ExtensionSet) -> bool {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    event = "job.priority_scan_failed",
                    path = %source.display(),
                    error = %e,
                    "job.priority_scan_failed"
                );
                return false;
            }
        };
        if entry.file_type().is_file() && extensions.matches(entry.path()) {
            return true;
        }
    }
    false
}

async fn join_outcome(handle: JoinHandle<JobOutcome>, (job, priority): &(BackupJob, bool)) -> JobOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => JobOutcome {
            name: job.name().to_string(),
            priority: *priority,
            state: JobState::Error,
            message: Some(format!("job task failed: {e}")),
        },
    }
}

struct Driver {
    job: BackupJob,
    priority: bool,
    aggregator: StateAggregator,
    gate: ProcessGate,
    log: Arc<dyn LogSink>,
}

impl Driver {
    async fn drive(
        self,
        pool: Arc<Semaphore>,
        wait_for_priority: Option<watch::Receiver<bool>>,
    ) -> JobOutcome {
        let last_message = Arc::new(Mutex::new(None::<String>));
        {
            let slot = last_message.clone();
            self.job.subscribe(Arc::new(move |event: &JobEvent| {
                if let JobEvent::Error { message, .. } | JobEvent::Cancelled { message, .. } = event
                    && let Ok(mut slot) = slot.lock()
                {
                    *slot = Some(message.clone());
                }
            }));
        }

        if let Err(e) = self.job.analyze().await {
            if self.job.state() == JobState::Cancelled {
                return self.outcome(JobState::Cancelled, message_of(&last_message));
            }
            let message = e.to_string();
            tracing::error!(event = "job.analyze_failed", job = %self.job.name(), error = %message, "job.analyze_failed");
            self.log.error(&LogRecord {
                source: Some(self.job.source().path().to_path_buf()),
                destination: Some(self.job.destination().path().to_path_buf()),
                ..LogRecord::new(self.job.name(), message.clone())
            });
            return self.outcome(JobState::Error, Some(message));
        }

        if let Some(mut rx) = wait_for_priority {
            tracing::debug!(event = "job.wait_priority", job = %self.job.name(), "job.wait_priority");
            let _ = rx.wait_for(|done| *done).await;
        }

        let _permit = match pool.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.outcome(JobState::Error, Some("job pool closed".to_string()));
            }
        };

        if self.job.state().is_terminal() {
            return self.outcome(self.job.state(), message_of(&last_message));
        }

        self.aggregator.create_job_state(&self.job);
        let handle = match self.job.run() {
            Ok(handle) => handle,
            Err(e) => {
                let state = self.job.state();
                let message = message_of(&last_message).or_else(|| Some(e.to_string()));
                return self.outcome(state, message);
            }
        };

        if self.gate.is_blocked() {
            tracing::info!(event = "gate.job_held", job = %self.job.name(), "gate.job_held");
            self.job.pause();
            // The gate may have cleared between the check and the pause, after
            // the watcher's resume already ran against a still-running job.
            if !self.gate.is_blocked() {
                self.job.resume();
            }
        }

        let state = handle.await.unwrap_or(JobState::Error);
        self.outcome(state, message_of(&last_message))
    }

    fn outcome(&self, state: JobState, message: Option<String>) -> JobOutcome {
        JobOutcome {
            name: self.job.name().to_string(),
            priority: self.priority,
            state,
            message,
        }
    }
}

fn message_of(slot: &Mutex<Option<String>>) -> Option<String> {
    slot.lock().ok().and_then(|m| m.clone())
}
