use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dirsave_core::{
    BackupJob, BackupStrategy, CryptoClient, CryptoClientConfig, Error, ExtensionSet, JobState,
    LogLevel, MemoryLogSink, TaskContext, TaskKind,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

fn client_config(socket: &Path) -> CryptoClientConfig {
    CryptoClientConfig {
        executable: PathBuf::from("/nonexistent/dirsave-test-worker"),
        socket_path: socket.to_path_buf(),
        key: "k3y".to_string(),
        connect_timeout: Duration::from_millis(300),
        response_timeout: Duration::from_secs(5),
    }
}

struct Conn {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn request(&mut self) -> Value {
        let line = self.lines.next_line().await.unwrap().expect("request line");
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

/// Fake worker: hands every accepted connection to the test.
fn fake_worker(socket: &Path) -> mpsc::UnboundedReceiver<Conn> {
    let listener = UnixListener::bind(socket).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (r, w) = stream.into_split();
            let conn = Conn {
                lines: BufReader::new(r).lines(),
                writer: w,
            };
            if tx.send(conn).is_err() {
                return;
            }
        }
    });
    rx
}

/// Fake worker that answers every request with `duration` on every connection.
fn echo_worker(socket: &Path, duration: i64) {
    let mut conns = fake_worker(socket);
    tokio::spawn(async move {
        while let Some(mut conn) = conns.recv().await {
            tokio::spawn(async move {
                while let Ok(Some(line)) = conn.lines.next_line().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    conn.reply(json!({
                        "FileName": req["FileName"],
                        "Duration": duration,
                        "RequestId": req["RequestId"],
                    }))
                    .await;
                }
            });
        }
    });
}

#[tokio::test]
async fn crypt_sends_path_and_key_and_returns_duration() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = client.acquire().await.unwrap();
    let mut conn = conns.recv().await.unwrap();

    let target = temp.path().join("a.txt");
    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        let req = conn.request().await;
        assert_eq!(req["FileName"], target.display().to_string());
        assert_eq!(req["CryptoKey"], "k3y");
        assert!(req["RequestId"].is_u64());
        conn.reply(json!({ "FileName": req["FileName"], "Duration": 42, "RequestId": req["RequestId"] }))
            .await;
    });
    assert_eq!(result.unwrap(), 42);
}

#[tokio::test]
async fn leases_share_one_connection_and_the_last_release_closes_it() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let first = client.acquire().await.unwrap();
    let second = client.acquire().await.unwrap();
    assert_eq!(client.ref_count(), 2);
    let mut conn = conns.recv().await.unwrap();
    assert!(conns.try_recv().is_err(), "second acquire must not reconnect");

    drop(first);
    assert_eq!(client.ref_count(), 1);
    assert!(client.is_connected());

    drop(second);
    assert_eq!(client.ref_count(), 0);
    assert!(!client.is_connected());
    let eof = tokio::time::timeout(Duration::from_secs(5), conn.lines.next_line())
        .await
        .unwrap()
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn same_path_requests_are_matched_by_request_id() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = Arc::new(client.acquire().await.unwrap());
    let mut conn = conns.recv().await.unwrap();
    let target = temp.path().join("shared.txt");

    let l1 = lease.clone();
    let t1 = target.clone();
    let first = tokio::spawn(async move { l1.crypt(&t1).await });
    let req1 = conn.request().await;

    let l2 = lease.clone();
    let t2 = target.clone();
    let second = tokio::spawn(async move { l2.crypt(&t2).await });
    let req2 = conn.request().await;
    assert_ne!(req1["RequestId"], req2["RequestId"]);

    conn.reply(json!({ "FileName": req2["FileName"], "Duration": 200, "RequestId": req2["RequestId"] }))
        .await;
    conn.reply(json!({ "FileName": req1["FileName"], "Duration": 100, "RequestId": req1["RequestId"] }))
        .await;

    assert_eq!(first.await.unwrap().unwrap(), 100);
    assert_eq!(second.await.unwrap().unwrap(), 200);
}

#[tokio::test]
async fn responses_without_request_id_fall_back_to_oldest_same_path() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = Arc::new(client.acquire().await.unwrap());
    let mut conn = conns.recv().await.unwrap();
    let target = temp.path().join("legacy.txt");

    let l1 = lease.clone();
    let t1 = target.clone();
    let first = tokio::spawn(async move { l1.crypt(&t1).await });
    let req = conn.request().await;
    conn.reply(json!({ "FileName": req["FileName"], "Duration": -1 }))
        .await;

    assert_eq!(first.await.unwrap().unwrap(), -1);
}

#[tokio::test]
async fn unreachable_worker_fails_with_connection_failed() {
    let temp = TempDir::new().unwrap();
    let client = Arc::new(CryptoClient::new(client_config(&temp.path().join("absent.sock"))));

    let err = client.acquire().await.err().expect("acquire must fail");
    assert!(matches!(err, Error::ConnectionFailed { .. }), "{err}");
    assert_eq!(client.ref_count(), 0);
}

#[tokio::test]
async fn malformed_response_is_a_protocol_error_and_next_call_reconnects() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = client.acquire().await.unwrap();
    let mut conn = conns.recv().await.unwrap();
    let target = temp.path().join("a.txt");

    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        conn.request().await;
        conn.send_raw("this is not json").await;
    });
    assert!(matches!(result, Err(Error::Protocol { .. })));

    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        let mut fresh = conns.recv().await.unwrap();
        let req = fresh.request().await;
        fresh
            .reply(json!({ "FileName": req["FileName"], "Duration": 7, "RequestId": req["RequestId"] }))
            .await;
    });
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn response_without_numeric_duration_is_a_protocol_error() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = client.acquire().await.unwrap();
    let mut conn = conns.recv().await.unwrap();
    let target = temp.path().join("a.txt");

    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        let req = conn.request().await;
        conn.reply(json!({ "FileName": req["FileName"], "Duration": "soon", "RequestId": req["RequestId"] }))
            .await;
    });
    assert!(matches!(result, Err(Error::Protocol { .. })));
}

#[tokio::test]
async fn worker_dropping_the_connection_is_repaired_on_next_call() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let lease = client.acquire().await.unwrap();
    let mut conn = conns.recv().await.unwrap();
    let target = temp.path().join("a.txt");

    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        conn.request().await;
        drop(conn);
    });
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));

    let (result, ()) = tokio::join!(lease.crypt(&target), async {
        let mut fresh = conns.recv().await.unwrap();
        let req = fresh.request().await;
        fresh
            .reply(json!({ "FileName": req["FileName"], "Duration": 3, "RequestId": req["RequestId"] }))
            .await;
    });
    assert_eq!(result.unwrap(), 3);
}

#[tokio::test]
async fn silent_worker_times_out() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    let mut conns = fake_worker(&socket);

    let client = Arc::new(CryptoClient::new(CryptoClientConfig {
        response_timeout: Duration::from_millis(200),
        ..client_config(&socket)
    }));
    let lease = client.acquire().await.unwrap();
    let _conn = conns.recv().await.unwrap();

    let err = lease.crypt(&temp.path().join("a.txt")).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copy_tasks_encrypt_matching_files_including_nested_ones() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    echo_worker(&socket, 5);

    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    std::fs::create_dir_all(src.join("nested")).unwrap();
    std::fs::write(src.join("plain.bin"), b"p").unwrap();
    std::fs::write(src.join("secret.txt"), b"s").unwrap();
    std::fs::write(src.join("nested/a.txt"), b"a").unwrap();
    std::fs::write(src.join("nested/b.TXT"), b"b").unwrap();

    let client = Arc::new(CryptoClient::new(client_config(&socket)));
    let job = BackupJob::new(
        "enc",
        BackupStrategy::Differential,
        &src,
        &dst,
        TaskContext {
            crypto: Some(client.clone()),
            crypto_extensions: ExtensionSet::new(["txt"]),
            ..TaskContext::default()
        },
        Arc::new(MemoryLogSink::default()),
    );
    job.analyze().await.unwrap();
    assert_eq!(job.run().unwrap().await.unwrap(), JobState::Finished);

    let durations: Vec<(String, i64)> = job
        .tasks()
        .iter()
        .map(|t| (t.destination().unwrap().name(), t.encryption_duration_ms()))
        .collect();
    assert_eq!(
        durations,
        vec![
            ("nested".to_string(), 10),
            ("plain.bin".to_string(), 0),
            ("secret.txt".to_string(), 5),
        ]
    );
    assert_eq!(client.ref_count(), 0);
    assert!(!client.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_encryption_is_logged_as_a_warning_per_file() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("worker.sock");
    echo_worker(&socket, -1);

    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    std::fs::create_dir_all(src.join("nested")).unwrap();
    std::fs::write(src.join("nested/a.txt"), b"a").unwrap();
    std::fs::write(src.join("plain.bin"), b"p").unwrap();

    let log = Arc::new(MemoryLogSink::default());
    let job = BackupJob::new(
        "enc",
        BackupStrategy::Differential,
        &src,
        &dst,
        TaskContext {
            crypto: Some(Arc::new(CryptoClient::new(client_config(&socket)))),
            crypto_extensions: ExtensionSet::new(["txt"]),
            ..TaskContext::default()
        },
        log.clone(),
    );
    job.analyze().await.unwrap();
    assert_eq!(job.run().unwrap().await.unwrap(), JobState::Finished);

    let warnings: Vec<_> = log
        .records()
        .into_iter()
        .filter(|(level, _)| *level == LogLevel::Warning)
        .map(|(_, record)| record)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].job, "enc");
    assert_eq!(warnings[0].destination, Some(dst.join("nested/a.txt")));
    assert_eq!(warnings[0].encryption_ms, Some(-1));
    assert_eq!(warnings[0].task_kind, Some(TaskKind::Copy));
    assert_eq!(job.tasks()[0].encryption_duration_ms(), -1);
}
