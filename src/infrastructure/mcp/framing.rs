//! Framed JSON-RPC client over a byte stream pair
//!
//! MCP servers speak newline-delimited JSON-RPC 2.0 on their standard
//! streams. This module owns the framing: one request is one line written to
//! the peer, and a background reader task parses each line of output and
//! fulfills the pending request with the matching `id`. Responses correlate
//! strictly by id, never by arrival order.
//!
//! The client is generic over `AsyncRead`/`AsyncWrite`, so tests drive it
//! with `tokio::io::duplex` instead of a real child process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::infrastructure::mcp::error::{BridgeError, Result};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// One side of a newline-delimited JSON-RPC conversation.
///
/// Cheap to share behind an `Arc`; `send` takes `&self` and concurrent
/// callers interleave freely (writes are serialized line-at-a-time).
pub struct FramedClient {
    peer: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl FramedClient {
    /// Start a client over a read/write stream pair.
    ///
    /// `peer` labels log lines (typically the server name). The reader task
    /// runs until EOF or a read error on `reader`.
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            peer.clone(),
            reader,
            pending.clone(),
            closed.clone(),
        ));
        Self {
            peer,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            closed,
            reader_task,
        }
    }

    /// Whether the peer's output stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_len(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Send a structured JSON-RPC request and await its response.
    pub async fn send(&self, payload: &Value, timeout: Duration) -> Result<Value> {
        let line = serde_json::to_string(payload)
            .map_err(|err| BridgeError::InvalidRequest(format!("unserializable payload: {err}")))?;
        self.send_line(&line, payload, timeout).await
    }

    /// Send raw JSON-RPC text, forwarded verbatim.
    ///
    /// The text is parsed only to extract the correlation id; the bytes on
    /// the wire are the caller's. Text spanning multiple lines is re-framed
    /// compactly, since a literal newline would split the message.
    pub async fn send_raw(&self, raw: &str, timeout: Duration) -> Result<Value> {
        let trimmed = raw.trim();
        let payload: Value = serde_json::from_str(trimmed).map_err(|err| {
            BridgeError::InvalidRequest(format!("command is not valid JSON: {err}"))
        })?;
        if trimmed.contains('\n') {
            let line = serde_json::to_string(&payload)
                .map_err(|err| BridgeError::InvalidRequest(err.to_string()))?;
            self.send_line(&line, &payload, timeout).await
        } else {
            self.send_line(trimmed, &payload, timeout).await
        }
    }

    /// Write a notification: no id, no response expected.
    pub async fn notify(&self, payload: &Value, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed(self.peer.clone()));
        }
        let line = serde_json::to_string(payload)
            .map_err(|err| BridgeError::InvalidRequest(format!("unserializable payload: {err}")))?;
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BridgeError::Io(err.to_string())),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }

    async fn send_line(&self, line: &str, payload: &Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed(self.peer.clone()));
        }

        let key = request_id_key(payload)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            if pending.contains_key(&key) {
                return Err(BridgeError::InvalidRequest(format!(
                    "duplicate request id {key}"
                )));
            }
            pending.insert(key.clone(), tx);
        }
        // Removes the entry again if this future errors out or is dropped
        // before a response arrives (caller hung up).
        let guard = PendingGuard::new(key, self.pending.clone());

        let deadline = tokio::time::Instant::now() + timeout;

        // The write runs under the same deadline as the round trip, so a
        // child with a full input buffer cannot wedge the gateway.
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BridgeError::Io(err.to_string())),
            Err(_) => return Err(BridgeError::Timeout(timeout)),
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => {
                guard.disarm();
                Ok(response)
            }
            Ok(Err(_)) => Err(BridgeError::ChannelClosed(self.peer.clone())),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }
}

impl Drop for FramedClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for FramedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedClient")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Extract the correlation key from a request payload.
///
/// JSON-RPC ids are strings or numbers; anything else cannot be correlated
/// and is rejected at submission.
fn request_id_key(payload: &Value) -> Result<String> {
    match payload.get("id") {
        Some(id) if id.is_string() || id.is_number() => Ok(id.to_string()),
        Some(Value::Null) | None => Err(BridgeError::InvalidRequest(
            "request has no id to correlate a response with".to_string(),
        )),
        Some(other) => Err(BridgeError::InvalidRequest(format!(
            "unsupported id type: {other}"
        ))),
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry on drop unless the request completed.
struct PendingGuard {
    key: String,
    pending: PendingMap,
    armed: bool,
}

impl PendingGuard {
    fn new(key: String, pending: PendingMap) -> Self {
        Self {
            key,
            pending,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            lock_pending(&self.pending).remove(&self.key);
        }
    }
}

async fn read_loop<R>(peer: String, reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(server = %peer, error = %err, "discarding unparseable output line");
                        continue;
                    }
                };
                let Some(id) = value.get("id").filter(|id| !id.is_null()) else {
                    // Server-initiated notification; nothing to correlate.
                    debug!(server = %peer, "ignoring output without id");
                    continue;
                };
                let key = id.to_string();
                let sender = lock_pending(&pending).remove(&key);
                match sender {
                    Some(tx) => {
                        // A dropped receiver means the caller gave up; the
                        // response is simply discarded.
                        let _ = tx.send(value);
                    }
                    None => {
                        warn!(server = %peer, id = %key, "discarding response with no pending request");
                    }
                }
            }
            Ok(None) => {
                debug!(server = %peer, "output stream closed");
                break;
            }
            Err(err) => {
                warn!(server = %peer, error = %err, "read error on output stream");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Pending requests are left in place: their callers run into their own
    // deadlines, matching the recovery contract for mid-flight crashes.
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Fake MCP server: reads request lines, replies `{"jsonrpc","id","result"}`
    /// after an optional per-request delay keyed off the `method` field.
    fn spawn_fake_server(io: tokio::io::DuplexStream) {
        let (read, mut write) = split(io);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).expect("client sent valid JSON");
                let id = request["id"].clone();
                if request["method"] == "slow" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                if request["method"] == "never" {
                    continue;
                }
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"echo": request["method"].clone()}
                });
                let mut bytes = serde_json::to_vec(&response).unwrap();
                bytes.push(b'\n');
                write.write_all(&bytes).await.unwrap();
            }
        });
    }

    fn client_pair() -> FramedClient {
        let (client_io, server_io) = duplex(64 * 1024);
        spawn_fake_server(server_io);
        let (read, write) = split(client_io);
        FramedClient::new("fake", read, write)
    }

    #[tokio::test]
    async fn round_trip_returns_matching_id() {
        let client = client_pair();
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}});
        let response = client.send(&request, TIMEOUT).await.unwrap();

        assert_eq!(response["id"], 1);
        let has_result = response.get("result").is_some();
        let has_error = response.get("error").is_some();
        assert!(has_result ^ has_error, "exactly one of result/error");
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_by_id() {
        let client = std::sync::Arc::new(client_pair());

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let client = client.clone();
            // Odd requests are delayed server-side so completions interleave
            // out of submission order.
            let method = if i % 2 == 0 {
                format!("fast-{i}")
            } else {
                "slow".to_string()
            };
            handles.push(tokio::spawn(async move {
                let request = json!({"jsonrpc": "2.0", "id": i, "method": method, "params": {}});
                let response = client.send(&request, TIMEOUT).await.unwrap();
                (i, response)
            }));
        }

        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response["id"], i, "caller {i} got someone else's response");
        }
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn orphan_response_is_discarded() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (read, write) = split(client_io);
        let client = FramedClient::new("fake", read, write);

        let (server_read, mut server_write) = split(server_io);
        // Unsolicited response for an id nobody asked about.
        server_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{}}\n")
            .await
            .unwrap();

        // A normal round trip still works afterwards.
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
                let mut bytes = serde_json::to_vec(&response).unwrap();
                bytes.push(b'\n');
                server_write.write_all(&bytes).await.unwrap();
            }
        });

        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {}});
        let response = client.send(&request, TIMEOUT).await.unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn missing_id_is_rejected() {
        let client = client_pair();
        let request = json!({"jsonrpc": "2.0", "method": "tools/list", "params": {}});
        let err = client.send(&request, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_while_in_flight() {
        let client = std::sync::Arc::new(client_pair());

        let slow = json!({"jsonrpc": "2.0", "id": 7, "method": "slow", "params": {}});
        let first = {
            let client = client.clone();
            let slow = slow.clone();
            tokio::spawn(async move { client.send(&slow, TIMEOUT).await })
        };
        // Give the first request time to register its pending entry.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let duplicate = json!({"jsonrpc": "2.0", "id": 7, "method": "fast", "params": {}});
        let err = client.send(&duplicate, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));

        // The original caller is unaffected.
        let response = first.await.unwrap().unwrap();
        assert_eq!(response["id"], 7);
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let client = client_pair();
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "never", "params": {}});
        let err = client
            .send(&request, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(client.pending_len(), 0);

        // The id is reusable after the timeout cleaned up.
        let retry = json!({"jsonrpc": "2.0", "id": 1, "method": "retry", "params": {}});
        let response = client.send(&retry, TIMEOUT).await.unwrap();
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn raw_text_is_forwarded_verbatim() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (read, write) = split(client_io);
        let client = FramedClient::new("fake", read, write);

        let raw = r#"{"jsonrpc":"2.0","id":"abc","method":"tools/call","params":{"name":"search"}}"#;
        let (server_read, mut server_write) = split(server_io);
        let expected = raw.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, expected, "raw command altered in transit");
            server_write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"abc\",\"result\":{}}\n")
                .await
                .unwrap();
        });

        let response = client.send_raw(raw, TIMEOUT).await.unwrap();
        assert_eq!(response["id"], "abc");
    }

    #[tokio::test]
    async fn string_and_number_ids_do_not_collide() {
        let client = std::sync::Arc::new(client_pair());
        let numeric = json!({"jsonrpc": "2.0", "id": 1, "method": "slow", "params": {}});
        let stringy = json!({"jsonrpc": "2.0", "id": "1", "method": "fast", "params": {}});

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.send(&numeric, TIMEOUT).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let response = client.send(&stringy, TIMEOUT).await.unwrap();
        assert_eq!(response["id"], "1");
        let response = first.await.unwrap().unwrap();
        assert_eq!(response["id"], 1);
    }
}
