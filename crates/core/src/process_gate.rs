use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Linux reports at most this many bytes of a process name.
const COMM_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSignal {
    OneOrMoreBlacklistedRunning,
    NoneRunning,
}

/// Latest verdict of the blacklist monitor. `true` means jobs must hold.
#[derive(Debug, Clone)]
pub struct ProcessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ProcessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self, signal: GateSignal) {
        let blocked = signal == GateSignal::OneOrMoreBlacklistedRunning;
        let changed = self.tx.send_if_modified(|current| {
            if *current == blocked {
                return false;
            }
            *current = blocked;
            true
        });
        if changed {
            tracing::info!(event = "gate.changed", blocked, "gate.changed");
        }
    }

    pub fn is_blocked(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

fn normalize(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
}

fn name_matches(process_name: &str, wanted: &str) -> bool {
    let process_name = normalize(process_name);
    let wanted = normalize(wanted);
    if wanted.is_empty() {
        return false;
    }
    process_name == wanted
        || (process_name.len() == COMM_MAX_LEN && wanted.starts_with(&process_name))
}

/// Names from `blacklist` that currently match a running process.
pub fn running_blacklisted(blacklist: &[String]) -> Vec<String> {
    if blacklist.is_empty() {
        return Vec::new();
    }
    let mut system = System::new();
    system.refresh_processes();
    blacklist
        .iter()
        .filter(|wanted| {
            system
                .processes()
                .values()
                .any(|p| name_matches(p.name(), wanted))
        })
        .cloned()
        .collect()
}

pub fn is_process_running(name: &str) -> bool {
    !running_blacklisted(&[name.to_string()]).is_empty()
}

/// Polls the process table and feeds the result into `gate` until `cancel` fires.
pub fn spawn_blacklist_poller(
    gate: ProcessGate,
    blacklist: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if blacklist.is_empty() {
            return;
        }
        loop {
            let list = blacklist.clone();
            let running = tokio::task::spawn_blocking(move || running_blacklisted(&list))
                .await
                .unwrap_or_default();
            if running.is_empty() {
                gate.signal(GateSignal::NoneRunning);
            } else {
                tracing::debug!(event = "gate.blacklisted_running", processes = ?running, "gate.blacklisted_running");
                gate.signal(GateSignal::OneOrMoreBlacklistedRunning);
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
