use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::ExtensionSet;
use crate::crypto_client::CryptoClient;
use crate::entry::Entry;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Copy,
    Remove,
    Rename,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Remove => "remove",
            Self::Rename => "rename",
        }
    }
}

/// Shared collaborators handed to every task a job executes.
#[derive(Clone)]
pub struct TaskContext {
    pub crypto: Option<Arc<CryptoClient>>,
    pub crypto_extensions: ExtensionSet,
    /// Files above this many bytes go through `large_transfer_gate`.
    pub large_file_threshold: Option<u64>,
    pub large_transfer_gate: Arc<Semaphore>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            crypto: None,
            crypto_extensions: ExtensionSet::default(),
            large_file_threshold: None,
            large_transfer_gate: Arc::new(Semaphore::new(1)),
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("crypto", &self.crypto.is_some())
            .field("crypto_extensions", &self.crypto_extensions)
            .field("large_file_threshold", &self.large_file_threshold)
            .finish()
    }
}

/// One filesystem operation produced by a job's analysis.
#[derive(Debug, Clone)]
pub struct BackupTask {
    kind: TaskKind,
    source: Option<Entry>,
    destination: Option<Entry>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    encryption_duration_ms: i64,
    encryption_failures: Vec<PathBuf>,
}

impl BackupTask {
    /// Copies `source` so that it ends up at `destination`.
    pub fn copy(source: Entry, destination: Entry) -> Self {
        Self::new(TaskKind::Copy, Some(source), Some(destination))
    }

    pub fn remove(destination: Entry) -> Self {
        Self::new(TaskKind::Remove, None, Some(destination))
    }

    /// Renames `destination` to the name of `source`.
    pub fn rename(source: Entry, destination: Entry) -> Self {
        Self::new(TaskKind::Rename, Some(source), Some(destination))
    }

    fn new(kind: TaskKind, source: Option<Entry>, destination: Option<Entry>) -> Self {
        Self {
            kind,
            source,
            destination,
            started_at: None,
            finished_at: None,
            encryption_duration_ms: 0,
            encryption_failures: Vec::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_remove(&self) -> bool {
        self.kind == TaskKind::Remove
    }

    pub fn source(&self) -> Option<&Entry> {
        self.source.as_ref()
    }

    pub fn destination(&self) -> Option<&Entry> {
        self.destination.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Milliseconds spent encrypting, `-1` when the worker reported a failure.
    pub fn encryption_duration_ms(&self) -> i64 {
        self.encryption_duration_ms
    }

    /// Copied files the worker failed to encrypt during the last execution.
    pub fn encryption_failures(&self) -> &[PathBuf] {
        &self.encryption_failures
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Bytes this task moves: the current size of a Copy source, 0 otherwise.
    pub fn transfer_size(&self) -> u64 {
        match (self.kind, &self.source) {
            (TaskKind::Copy, Some(source)) => source.size().unwrap_or(0),
            _ => 0,
        }
    }

    pub async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        self.started_at = Some(Utc::now());
        let result = match self.kind {
            TaskKind::Copy => self.execute_copy(ctx).await,
            TaskKind::Remove => self.execute_remove().await,
            TaskKind::Rename => self.execute_rename().await,
        };
        self.finished_at = Some(Utc::now());
        result
    }

    async fn execute_copy(&mut self, ctx: &TaskContext) -> Result<()> {
        let source = required(&self.source, "source", self.kind)?;
        let destination = required(&self.destination, "destination", self.kind)?;
        let destination_dir = destination.parent().ok_or_else(|| Error::NotFound {
            path: destination.path().to_path_buf(),
        })?;

        let threshold = ctx.large_file_threshold;
        let _permit = match (&source, threshold) {
            (Entry::File(file), Some(threshold)) if file.size()? > threshold => {
                ctx.large_transfer_gate.clone().acquire_owned().await.ok()
            }
            _ => None,
        };

        // Directory copies run on one blocking thread, so each large file
        // inside waits for the gate there.
        let gate = ctx.large_transfer_gate.clone();
        let runtime = tokio::runtime::Handle::current();
        let extensions = ctx.crypto_extensions.clone();
        let to_encrypt = blocking(move || {
            let copied = match &source {
                Entry::File(_) => source.copy(&destination_dir, true)?,
                Entry::Directory(dir) => Entry::Directory(dir.copy_with(
                    &destination_dir,
                    true,
                    |_, size| match threshold {
                        Some(threshold) if size > threshold => {
                            runtime.block_on(gate.clone().acquire_owned()).ok()
                        }
                        _ => None,
                    },
                )?),
            };
            let targets: Vec<PathBuf> = match &copied {
                Entry::File(f) => vec![f.path().to_path_buf()],
                Entry::Directory(d) => d
                    .files()?
                    .into_iter()
                    .map(|f| f.path().to_path_buf())
                    .collect(),
            };
            Ok(targets
                .into_iter()
                .filter(|p| extensions.matches(p))
                .collect::<Vec<_>>())
        })
        .await?;

        if to_encrypt.is_empty() {
            return Ok(());
        }
        let Some(crypto) = &ctx.crypto else {
            return Ok(());
        };

        let lease = crypto.acquire().await?;
        let mut total = 0i64;
        self.encryption_failures.clear();
        for path in to_encrypt {
            let duration = lease.crypt(&path).await?;
            if duration < 0 {
                tracing::warn!(
                    event = "crypto.encrypt_failed",
                    path = %path.display(),
                    "crypto.encrypt_failed"
                );
                self.encryption_failures.push(path);
            } else {
                total = total.saturating_add(duration);
            }
        }
        self.encryption_duration_ms = if self.encryption_failures.is_empty() {
            total
        } else {
            -1
        };
        Ok(())
    }

    async fn execute_remove(&mut self) -> Result<()> {
        let destination = required(&self.destination, "destination", self.kind)?;
        blocking(move || destination.remove()).await
    }

    async fn execute_rename(&mut self) -> Result<()> {
        let source = required(&self.source, "source", self.kind)?;
        let mut destination = required(&self.destination, "destination", self.kind)?;
        let renamed = blocking(move || {
            destination.rename(&source.name(), true)?;
            Ok(destination)
        })
        .await?;
        self.destination = Some(renamed);
        Ok(())
    }
}

fn required(entry: &Option<Entry>, role: &str, kind: TaskKind) -> Result<Entry> {
    entry.clone().ok_or_else(|| Error::InvalidConfig {
        message: format!("{} task has no {role}", kind.as_str()),
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("filesystem task panicked: {e}"))))?
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entry::{DirEntry, FileEntry};

    #[tokio::test]
    async fn copy_places_file_under_destination_parent() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"0123456789").unwrap();

        let mut task = BackupTask::copy(
            Entry::File(FileEntry::new(src.path().join("a.txt"))),
            Entry::File(FileEntry::new(dst.path().join("a.txt"))),
        );
        assert_eq!(task.transfer_size(), 10);
        task.execute(&TaskContext::default()).await.unwrap();

        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"0123456789");
        assert!(task.duration().is_some());
        assert_eq!(task.encryption_duration_ms(), 0);
    }

    #[tokio::test]
    async fn copy_overwrites_existing_destination() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"new").unwrap();
        std::fs::write(dst.path().join("a.txt"), b"old contents").unwrap();

        let mut task = BackupTask::copy(
            Entry::File(FileEntry::new(src.path().join("a.txt"))),
            Entry::File(FileEntry::new(dst.path().join("a.txt"))),
        );
        task.execute(&TaskContext::default()).await.unwrap();
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_of_missing_source_fails_with_not_found() {
        let dst = tempfile::tempdir().unwrap();
        let mut task = BackupTask::copy(
            Entry::File(FileEntry::new(dst.path().join("missing.txt"))),
            Entry::File(FileEntry::new(dst.path().join("out/missing.txt"))),
        );
        let err = task.execute(&TaskContext::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(task.finished_at().is_some());
    }

    #[tokio::test]
    async fn remove_deletes_directory_subtree() {
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dst.path().join("old/nested")).unwrap();
        std::fs::write(dst.path().join("old/nested/x"), b"x").unwrap();

        let mut task = BackupTask::remove(Entry::Directory(DirEntry::new(dst.path().join("old"))));
        assert!(task.is_remove());
        assert_eq!(task.transfer_size(), 0);
        task.execute(&TaskContext::default()).await.unwrap();
        assert!(!dst.path().join("old").exists());
    }

    #[tokio::test]
    async fn rename_gives_destination_the_source_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("draft.txt"), b"d").unwrap();

        let mut task = BackupTask::rename(
            Entry::File(FileEntry::new(dir.path().join("final.txt"))),
            Entry::File(FileEntry::new(dir.path().join("draft.txt"))),
        );
        task.execute(&TaskContext::default()).await.unwrap();

        assert!(dir.path().join("final.txt").is_file());
        assert!(!dir.path().join("draft.txt").exists());
        assert_eq!(
            task.destination().unwrap().path(),
            dir.path().join("final.txt")
        );
    }

    #[tokio::test]
    async fn matching_extension_without_crypto_client_is_copied_plain() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("secret.txt"), b"s").unwrap();

        let ctx = TaskContext {
            crypto_extensions: ExtensionSet::new(["txt"]),
            ..TaskContext::default()
        };
        let mut task = BackupTask::copy(
            Entry::File(FileEntry::new(src.path().join("secret.txt"))),
            Entry::File(FileEntry::new(dst.path().join("secret.txt"))),
        );
        task.execute(&ctx).await.unwrap();
        assert_eq!(std::fs::read(dst.path().join("secret.txt")).unwrap(), b"s");
    }

    #[tokio::test]
    async fn large_files_wait_for_the_transfer_gate() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("big.bin"), vec![0u8; 4096]).unwrap();

        let ctx = TaskContext {
            large_file_threshold: Some(1024),
            ..TaskContext::default()
        };
        let held = ctx.large_transfer_gate.clone().acquire_owned().await.unwrap();

        let mut task = BackupTask::copy(
            Entry::File(FileEntry::new(src.path().join("big.bin"))),
            Entry::File(FileEntry::new(dst.path().join("big.bin"))),
        );
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            task.execute(&ctx2).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!dst.path().join("big.bin").exists());

        drop(held);
        handle.await.unwrap();
        assert!(dst.path().join("big.bin").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_files_inside_a_copied_directory_wait_for_the_transfer_gate() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("tree/nested")).unwrap();
        std::fs::write(src.path().join("tree/small.txt"), b"s").unwrap();
        std::fs::write(src.path().join("tree/nested/big.bin"), vec![0u8; 8192]).unwrap();

        let ctx = TaskContext {
            large_file_threshold: Some(1024),
            ..TaskContext::default()
        };
        let held = ctx.large_transfer_gate.clone().acquire_owned().await.unwrap();

        let mut task = BackupTask::copy(
            Entry::Directory(DirEntry::new(src.path().join("tree"))),
            Entry::Directory(DirEntry::new(dst.path().join("tree"))),
        );
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            task.execute(&ctx2).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!dst.path().join("tree/nested/big.bin").exists());

        drop(held);
        handle.await.unwrap();
        assert_eq!(
            std::fs::read(dst.path().join("tree/nested/big.bin")).unwrap().len(),
            8192
        );
        assert!(dst.path().join("tree/small.txt").is_file());
        assert_eq!(ctx.large_transfer_gate.available_permits(), 1);
    }
}
