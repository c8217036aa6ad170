use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Lifecycle notification emitted by a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    Started { job: String },
    Progress { job: String, task_index: usize },
    Paused { job: String },
    Resumed { job: String },
    Finished { job: String },
    Error { job: String, message: String },
    Cancelled { job: String, message: String },
}

impl JobEvent {
    pub fn job(&self) -> &str {
        match self {
            Self::Started { job }
            | Self::Progress { job, .. }
            | Self::Paused { job }
            | Self::Resumed { job }
            | Self::Finished { job }
            | Self::Error { job, .. }
            | Self::Cancelled { job, .. } => job,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}

pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobObserver for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

/// Thread-safe observer list. Publishing snapshots the list first so an
/// observer may subscribe further observers without deadlocking.
#[derive(Default)]
pub struct EventHub {
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
}

impl EventHub {
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        if let Ok(mut guard) = self.observers.write() {
            guard.push(observer);
        }
    }

    pub fn publish(&self, event: &JobEvent) {
        let observers = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_event(event);
        }
    }
}

impl JobObserver for EventHub {
    fn on_event(&self, event: &JobEvent) {
        self.publish(event);
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.observers.read().map(|g| g.len()).unwrap_or(0);
        f.debug_struct("EventHub").field("observers", &n).finish()
    }
}
