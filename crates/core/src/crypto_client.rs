use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::config::CryptoSettings;
use crate::process_gate::is_process_running;
use crate::{Error, Result};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CryptoClientConfig {
    pub executable: PathBuf,
    pub socket_path: PathBuf,
    pub key: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl CryptoClientConfig {
    pub fn from_settings(settings: &CryptoSettings) -> Self {
        Self {
            executable: PathBuf::from(&settings.executable),
            socket_path: PathBuf::from(&settings.socket_path),
            key: settings.key.clone(),
            connect_timeout: settings.connect_timeout(),
            response_timeout: settings.response_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CryptRequest<'a> {
    file_name: &'a str,
    crypto_key: &'a str,
    request_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CryptResponse {
    file_name: Option<String>,
    duration: Option<serde_json::Value>,
    request_id: Option<u64>,
}

struct Waiter {
    file_name: String,
    tx: oneshot::Sender<Result<i64>>,
}

/// Requests awaiting a response, ordered by request id (oldest first).
#[derive(Default)]
struct Pending {
    waiters: BTreeMap<u64, Waiter>,
}

impl Pending {
    fn take(&mut self, response: &CryptResponse) -> Option<Waiter> {
        if let Some(id) = response.request_id {
            return self.waiters.remove(&id);
        }
        // Workers that do not echo the id are matched by path, oldest request first.
        let file_name = response.file_name.as_deref()?;
        let id = self
            .waiters
            .iter()
            .find(|(_, w)| w.file_name == file_name)
            .map(|(id, _)| *id)?;
        self.waiters.remove(&id)
    }

    fn fail_all(&mut self, make_err: impl Fn() -> Error) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.tx.send(Err(make_err()));
        }
    }
}

struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn start(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_responses(r, pending.clone(), alive.clone()));
        Self {
            writer: tokio::sync::Mutex::new(w),
            pending,
            alive,
            reader,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    fn register(&self, id: u64, file_name: &str) -> Result<oneshot::Receiver<Result<i64>>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().map_err(|_| Error::ConnectionFailed {
            message: "pending request table poisoned".to_string(),
        })?;
        pending.waiters.insert(
            id,
            Waiter {
                file_name: file_name.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiters.remove(&id);
        }
    }

    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(line.as_bytes()).await?;
        w.write_all(b"\n").await?;
        w.flush().await
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Ok(mut pending) = self.pending.lock() {
            pending.fail_all(|| Error::ConnectionFailed {
                message: "crypto worker connection closed".to_string(),
            });
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(reader: OwnedReadHalf, pending: Arc<Mutex<Pending>>, alive: Arc<AtomicBool>) {
    let mut lines = BufReader::new(reader).lines();
    let failure = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = dispatch_response(&pending, &line) {
                    tracing::warn!(event = "crypto.protocol_error", error = %e, "crypto.protocol_error");
                    alive.store(false, Ordering::SeqCst);
                    if let Ok(mut p) = pending.lock() {
                        let message = e.to_string();
                        p.fail_all(|| Error::Protocol {
                            message: message.clone(),
                        });
                    }
                    return;
                }
            }
            Ok(None) => break "crypto worker closed the connection".to_string(),
            Err(e) => break format!("crypto worker read failed: {e}"),
        }
    };

    tracing::debug!(event = "crypto.disconnected", reason = %failure, "crypto.disconnected");
    alive.store(false, Ordering::SeqCst);
    if let Ok(mut p) = pending.lock() {
        p.fail_all(|| Error::ConnectionFailed {
            message: failure.clone(),
        });
    }
}

fn dispatch_response(pending: &Mutex<Pending>, line: &str) -> Result<()> {
    let response: CryptResponse =
        serde_json::from_str(line.trim_end()).map_err(|e| Error::Protocol {
            message: format!("invalid response line: {e}"),
        })?;

    let waiter = {
        let mut p = pending.lock().map_err(|_| Error::Protocol {
            message: "pending request table poisoned".to_string(),
        })?;
        p.take(&response)
    };
    let Some(waiter) = waiter else {
        tracing::warn!(
            event = "crypto.unmatched_response",
            request_id = response.request_id,
            file_name = response.file_name.as_deref(),
            "crypto.unmatched_response"
        );
        return Ok(());
    };

    let duration = response
        .duration
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| Error::Protocol {
            message: format!("response for {} lacks a numeric Duration", waiter.file_name),
        });
    let _ = waiter.tx.send(duration);
    Ok(())
}

/// Client for the external encryption worker.
///
/// One connection is shared by every holder of a [`CryptoLease`]. The first
/// lease opens it (starting the worker when it is not running), the last one
/// to be dropped closes it. Responses are matched to callers by request id, so
/// concurrent requests for the same path never receive each other's result.
pub struct CryptoClient {
    config: CryptoClientConfig,
    refs: Mutex<usize>,
    conn: Mutex<Option<Arc<Connection>>>,
    connect_gate: tokio::sync::Mutex<()>,
    next_request_id: AtomicU64,
}

impl CryptoClient {
    pub fn new(config: CryptoClientConfig) -> Self {
        Self {
            config,
            refs: Mutex::new(0),
            conn: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CryptoClientConfig {
        &self.config
    }

    pub fn ref_count(&self) -> usize {
        self.refs.lock().map(|r| *r).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_alive())
    }

    /// Takes a reference on the shared connection, opening it on 0 → 1.
    pub async fn acquire(self: &Arc<Self>) -> Result<CryptoLease> {
        self.add_ref();
        let lease = CryptoLease {
            client: self.clone(),
        };
        // On failure the lease is dropped here, which gives the reference back.
        self.ensure_connected().await?;
        Ok(lease)
    }

    fn add_ref(&self) {
        if let Ok(mut refs) = self.refs.lock() {
            *refs += 1;
        }
    }

    fn release(&self) {
        let Ok(mut refs) = self.refs.lock() else {
            return;
        };
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            let conn = self.conn.lock().ok().and_then(|mut c| c.take());
            if let Some(conn) = conn {
                conn.shutdown();
                tracing::debug!(event = "crypto.released", "crypto.released");
            }
        }
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.conn.lock().ok().and_then(|c| c.clone())
    }

    async fn ensure_connected(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.current()
            && conn.is_alive()
        {
            return Ok(conn);
        }

        let _gate = self.connect_gate.lock().await;
        if let Some(conn) = self.current() {
            if conn.is_alive() {
                return Ok(conn);
            }
            tracing::info!(event = "crypto.reconnect", "crypto.reconnect");
            conn.shutdown();
        }

        let conn = Arc::new(self.connect().await?);
        if let Ok(mut slot) = self.conn.lock() {
            *slot = Some(conn.clone());
        }
        Ok(conn)
    }

    async fn connect(&self) -> Result<Connection> {
        let socket_path = &self.config.socket_path;
        let deadline = Instant::now() + self.config.connect_timeout;

        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(Connection::start(stream)),
            Err(e) => {
                tracing::debug!(
                    event = "crypto.connect_failed",
                    error = %e,
                    path = %socket_path.display(),
                    "crypto.connect_failed"
                );
            }
        }

        self.ensure_worker_running()?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ConnectionFailed {
                    message: format!(
                        "no crypto worker reachable at {} after {:?}",
                        socket_path.display(),
                        self.config.connect_timeout
                    ),
                });
            }
            sleep(CONNECT_RETRY_INTERVAL.min(remaining)).await;
            if let Ok(Ok(stream)) = timeout(remaining, UnixStream::connect(socket_path)).await {
                tracing::info!(
                    event = "crypto.connected",
                    path = %socket_path.display(),
                    "crypto.connected"
                );
                return Ok(Connection::start(stream));
            }
        }
    }

    fn ensure_worker_running(&self) -> Result<()> {
        let exe = &self.config.executable;
        let name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !name.is_empty() && is_process_running(&name) {
            return Ok(());
        }

        tracing::info!(event = "crypto.worker_spawn", executable = %exe.display(), "crypto.worker_spawn");
        tokio::process::Command::new(exe)
            .arg(&self.config.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::ConnectionFailed {
                message: format!(
                    "failed to start crypto worker: {} (path={})",
                    e,
                    exe.display()
                ),
            })?;
        Ok(())
    }

    async fn crypt(&self, path: &Path) -> Result<i64> {
        let file_name = path.to_str().ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })?;

        let conn = self.ensure_connected().await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&CryptRequest {
            file_name,
            crypto_key: &self.config.key,
            request_id,
        })
        .map_err(|e| Error::Protocol {
            message: format!("request json failed: {e}"),
        })?;

        let rx = conn.register(request_id, file_name)?;
        if let Err(e) = conn.send_line(&line).await {
            conn.unregister(request_id);
            conn.alive.store(false, Ordering::SeqCst);
            return Err(Error::ConnectionFailed {
                message: format!("crypto worker write failed: {e}"),
            });
        }

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionFailed {
                message: "crypto worker connection dropped before responding".to_string(),
            }),
            Err(_) => {
                conn.unregister(request_id);
                Err(Error::ConnectionFailed {
                    message: format!(
                        "crypto worker did not answer within {:?}",
                        self.config.response_timeout
                    ),
                })
            }
        }
    }
}

impl Drop for CryptoClient {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.conn.lock()
            && let Some(conn) = slot.take()
        {
            conn.shutdown();
        }
    }
}

/// A held reference on the crypto connection; dropping it releases the reference.
pub struct CryptoLease {
    client: Arc<CryptoClient>,
}

impl CryptoLease {
    /// Asks the worker to encrypt `path` in place and returns the reported
    /// duration in milliseconds (`-1` when the worker reports a failure).
    pub async fn crypt(&self, path: &Path) -> Result<i64> {
        self.client.crypt(path).await
    }
}

impl Drop for CryptoLease {
    fn drop(&mut self) {
        self.client.release();
    }
}
