//! Line-delimited JSON-RPC over a pair of byte streams, usually the stdio of
//! a short-lived helper process.

use crate::frame::{decode_line, encode_line, FrameError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("{0} not installed")]
    NotFound(String),
    #[error("failed to spawn {binary}: {message}")]
    Spawn { binary: String, message: String },
    #[error("rpc io failed: {0}")]
    Io(String),
    #[error("rpc call {0} timed out")]
    Timeout(String),
    #[error("rpc session timed out")]
    SessionTimeout,
    #[error("rpc closed")]
    Closed,
    #[error("rpc failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

type PendingTable = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

#[derive(Default)]
struct PendingCalls {
    table: Mutex<PendingTable>,
    closed: AtomicBool,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let mut table = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        table.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn resolve(&self, message: Value) {
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return;
        };
        let Some(tx) = self.lock().remove(&id) else {
            debug!(event = "rpc_unmatched_response", id);
            return;
        };
        let _ = tx.send(response_outcome(message));
    }

    fn close(&self) {
        let mut table = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        for (_, tx) in table.drain() {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

struct ClientInner<W> {
    writer: AsyncMutex<W>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl<W> Drop for ClientInner<W> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Correlates requests and responses by integer id. Cloning shares the same
/// stream pair and pending table.
pub struct RpcClient<W> {
    inner: Arc<ClientInner<W>>,
}

impl<W> Clone for RpcClient<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> RpcClient<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Starts reading responses from `reader` in the background. Lines that
    /// are not JSON, or whose id is not pending, are dropped.
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending = Arc::new(PendingCalls::default());
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line::<Value>(&line, 0) {
                        Some(Ok(message)) => reader_pending.resolve(message),
                        Some(Err(err)) => debug!(event = "rpc_non_protocol_line", error = %err),
                        None => {}
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(event = "rpc_read_failed", error = %err);
                        break;
                    }
                }
            }
            reader_pending.close();
        });
        Self {
            inner: Arc::new(ClientInner {
                writer: AsyncMutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                reader,
            }),
        }
    }

    /// Sends one request and waits up to `limit` for its response. A timeout
    /// frees the id without disturbing other calls in flight.
    pub async fn call(&self, method: &str, params: Value, limit: Duration) -> Result<Value, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.inner.pending.register(id)?;
        let request = json!({ "id": id, "method": method, "params": params });
        if let Err(err) = self.write(&request).await {
            self.inner.pending.forget(id);
            return Err(err);
        }
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.inner.pending.forget(id);
                Err(RpcError::Timeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget message without an id.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.write(&json!({ "method": method, "params": params }))
            .await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.closed.load(Ordering::SeqCst)
    }

    async fn write(&self, message: &Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let frame = encode_line(message)?;
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|err| RpcError::Io(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| RpcError::Io(err.to_string()))
    }
}

fn response_outcome(message: Value) -> Result<Value, RpcError> {
    match message.get("error") {
        Some(Value::Null) | None => {}
        Some(error) => return Err(RpcError::Remote(remote_message(error))),
    }
    match message.get("result") {
        Some(_) => match message {
            Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Null)),
            other => Ok(other),
        },
        None => Ok(message),
    }
}

fn remote_message(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// One helper process driven over its stdio. Not pooled: each probe run
/// spawns, talks, and tears down its own session.
pub struct RpcSession {
    binary: String,
    child: Child,
    client: RpcClient<ChildStdin>,
}

impl RpcSession {
    pub fn spawn<S: AsRef<str>>(binary: &str, args: &[S]) -> Result<Self, RpcError> {
        let mut child = Command::new(binary)
            .args(args.iter().map(AsRef::as_ref))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => RpcError::NotFound(binary.to_string()),
                _ => RpcError::Spawn {
                    binary: binary.to_string(),
                    message: err.to_string(),
                },
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Io("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Io("child stdout unavailable".to_string()))?;
        debug!(event = "rpc_session_spawned", binary, pid = ?child.id());
        Ok(Self {
            binary: binary.to_string(),
            child,
            client: RpcClient::new(stdout, stdin),
        })
    }

    pub fn client(&self) -> &RpcClient<ChildStdin> {
        &self.client
    }

    /// Runs `body` against this session, bounded by `limit`, then kills the
    /// process whether the exchange finished or not.
    pub async fn run<T, F, Fut>(mut self, limit: Duration, body: F) -> Result<T, RpcError>
    where
        F: FnOnce(RpcClient<ChildStdin>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let outcome = match tokio::time::timeout(limit, body(self.client.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(event = "rpc_session_timeout", binary = %self.binary);
                Err(RpcError::SessionTimeout)
            }
        };
        self.terminate().await;
        outcome
    }

    async fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(event = "rpc_session_kill_failed", binary = %self.binary, error = %err);
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type TestClient = RpcClient<WriteHalf<DuplexStream>>;

    struct FakePeer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakePeer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn connected_pair() -> (TestClient, FakePeer) {
        let (client_io, peer_io) = duplex(16 * 1024);
        let (client_read, client_write) = split(client_io);
        let (peer_read, peer_write) = split(peer_io);
        let client = RpcClient::new(client_read, client_write);
        let peer = FakePeer {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };
        (client, peer)
    }

    #[tokio::test]
    async fn unknown_ids_and_noise_are_ignored() {
        let (client, mut peer) = connected_pair();
        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call("account/rateLimits/read", json!({}), Duration::from_secs(2))
                    .await
            }
        });

        let request = peer.next_request().await;
        assert_eq!(request["method"], "account/rateLimits/read");
        assert_eq!(request["id"], 1);

        peer.send_line("booting helper...").await;
        peer.send_line(r#"{"id":99,"result":{"stale":true}}"#).await;
        peer.send_line(r#"{"id":1,"result":{"primary":{"usedPercent":40}}}"#)
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["primary"]["usedPercent"], 40);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_call_frees_its_id_without_affecting_others() {
        let (client, mut peer) = connected_pair();
        let slow = client.call("slow", json!({}), Duration::from_millis(50)).await;
        assert_eq!(slow, Err(RpcError::Timeout("slow".to_string())));
        assert_eq!(client.pending_count(), 0);

        let fast = tokio::spawn({
            let client = client.clone();
            async move { client.call("fast", json!({}), Duration::from_secs(2)).await }
        });
        let _slow_request = peer.next_request().await;
        let fast_request = peer.next_request().await;
        assert_eq!(fast_request["id"], 2);
        peer.send_line(r#"{"id":1,"result":"late"}"#).await;
        peer.send_line(r#"{"id":2,"result":"ok"}"#).await;

        assert_eq!(fast.await.unwrap(), Ok(json!("ok")));
    }

    #[tokio::test]
    async fn error_response_rejects_the_call() {
        let (client, mut peer) = connected_pair();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("initialize", json!({}), Duration::from_secs(2)).await }
        });
        let _ = peer.next_request().await;
        peer.send_line(r#"{"id":1,"error":{"code":-32600,"message":"not logged in"}}"#)
            .await;

        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::Remote("not logged in".to_string()))
        );
    }

    #[tokio::test]
    async fn response_without_result_resolves_to_whole_message() {
        let (client, mut peer) = connected_pair();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("status", json!({}), Duration::from_secs(2)).await }
        });
        let _ = peer.next_request().await;
        peer.send_line(r#"{"id":1,"primary":{"usedPercent":10}}"#).await;

        let message = call.await.unwrap().unwrap();
        assert_eq!(message["primary"]["usedPercent"], 10);
    }

    #[tokio::test]
    async fn stream_end_fails_pending_calls() {
        let (client, mut peer) = connected_pair();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("hang", json!({}), Duration::from_secs(5)).await }
        });
        let _ = peer.next_request().await;
        drop(peer);

        assert_eq!(call.await.unwrap(), Err(RpcError::Closed));
        assert!(client.is_closed());
        assert_eq!(
            client.call("again", json!({}), Duration::from_secs(1)).await,
            Err(RpcError::Closed)
        );
    }

    #[tokio::test]
    async fn notification_carries_no_id() {
        let (client, mut peer) = connected_pair();
        client.notify("initialized", json!({})).await.unwrap();
        let message = peer.next_request().await;
        assert_eq!(message["method"], "initialized");
        assert!(message.get("id").is_none());
    }
}
