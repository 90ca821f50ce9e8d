//! LSP transport: Content-Length framing and request/response correlation.
//!
//! A [`Transport`] owns the write half of a duplex byte stream and a read
//! loop task over the read half. Outbound requests are assigned monotonically
//! increasing ids and parked in a pending table; the read loop routes each
//! correlated response back to exactly one waiting caller. Server-initiated
//! notifications are dispatched to registered handlers on their own tasks so
//! a slow handler can never stall the read loop.

use crate::error::{LspError, LspResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, Message, RawMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Handler invoked for a server-initiated notification.
pub type NotificationHandler = Arc<dyn Fn(String, Option<Value>) + Send + Sync>;

/// Handler table key that catches methods with no dedicated handler.
pub const WILDCARD_METHOD: &str = "*";

type PendingMap = HashMap<u64, oneshot::Sender<LspResult<Value>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the transport handle and its read loop.
struct Shared {
    /// In-flight requests awaiting a correlated response. Every removal
    /// happens under this lock, whichever path resolves the call first.
    pending: Mutex<PendingMap>,
    /// Notification handlers keyed by method ("*" = wildcard).
    handlers: RwLock<HashMap<String, NotificationHandler>>,
    /// Flipped exactly once by `close`.
    closed: AtomicBool,
}

/// Framed JSON-RPC transport over an arbitrary duplex byte stream.
pub struct Transport {
    shared: Arc<Shared>,
    writer: Mutex<Option<BoxedWriter>>,
    next_id: AtomicU64,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Create a transport over the given stream halves and start its read
    /// loop.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let read_shared = Arc::clone(&shared);
        let read_task = tokio::spawn(async move {
            read_loop(BufReader::new(reader), read_shared).await;
        });

        Self {
            shared,
            writer: Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(1),
            read_task: Mutex::new(Some(read_task)),
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Resolves in exactly one of three ways: a correlated response (a
    /// protocol-level error becomes [`LspError::Server`]), the deadline
    /// firing ([`LspError::Timeout`]), or transport shutdown
    /// ([`LspError::Closed`]).
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> LspResult<Value> {
        if self.is_closed() {
            return Err(LspError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_vec(&request)?;

        // Register before writing so a fast response can never miss the
        // pending entry.
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_frame(&body).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: the transport went away.
            Ok(Err(_)) => Err(LspError::Closed),
            Err(_) => {
                // Deadline fired first. The entry may already be gone if the
                // response raced us; removal under the lock keeps the
                // cleanup exactly-once either way.
                self.shared.pending.lock().await.remove(&id);
                Err(LspError::Timeout(method.to_string()))
            }
        }
    }

    /// Send a notification (fire and forget).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        if self.is_closed() {
            return Err(LspError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        let body = serde_json::to_vec(&notification)?;
        self.write_frame(&body).await
    }

    /// Register a handler for a server-initiated notification method.
    ///
    /// The handler runs on a freshly spawned task per message, never on the
    /// read loop itself.
    pub async fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(String, Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .await
            .insert(method.into(), Arc::new(handler));
    }

    /// Register a catch-all handler for methods with no dedicated handler.
    pub async fn on_unhandled_notification<F>(&self, handler: F)
    where
        F: Fn(String, Option<Value>) + Send + Sync + 'static,
    {
        self.on_notification(WILDCARD_METHOD, handler).await;
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the transport.
    ///
    /// Idempotent. Fails every pending caller with [`LspError::Closed`] by
    /// replacing the pending table under its lock, then shuts down the
    /// writer and stops the read loop. Safe to call concurrently with
    /// in-flight requests.
    pub async fn close(&self) -> LspResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = std::mem::take(&mut *self.shared.pending.lock().await);
        for (_, tx) in drained {
            let _ = tx.send(Err(LspError::Closed));
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }

        debug!("Transport closed");
        Ok(())
    }

    /// Write one framed message.
    async fn write_frame(&self, body: &[u8]) -> LspResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LspError::Closed)?;

        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(body).await?;
        writer.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

/// Read frames until EOF, a read error, or abort by `close`.
///
/// A read failure terminates only this loop; callers still in flight
/// resolve through their own deadline or the shutdown path.
async fn read_loop<R>(mut reader: BufReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Transport read loop reached end of stream");
                break;
            }
            Err(e) => {
                if !shared.closed.load(Ordering::SeqCst) {
                    debug!(error = %e, "Transport read loop terminated");
                }
                break;
            }
        };

        let raw: RawMessage = match serde_json::from_slice(&body) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                continue;
            }
        };

        match raw.classify() {
            Some(Message::Response { id, result, error }) => {
                let sender = shared.pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let outcome = match error {
                            Some(err) => Err(LspError::Server {
                                code: err.code,
                                message: err.message,
                            }),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    // Abandoned call (deadline already fired) or unknown id.
                    None => trace!(id, "Dropping response with no pending call"),
                }
            }
            Some(Message::Notification { method, params }) => {
                let handler = {
                    let handlers = shared.handlers.read().await;
                    handlers
                        .get(&method)
                        .or_else(|| handlers.get(WILDCARD_METHOD))
                        .cloned()
                };
                match handler {
                    Some(handler) => {
                        tokio::spawn(async move {
                            handler(method, params);
                        });
                    }
                    None => trace!(method = %method, "No handler for notification"),
                }
            }
            Some(Message::ServerRequest { method, .. }) => {
                debug!(method = %method, "Dropping unsupported server-to-client request");
            }
            None => warn!("Dropping message that is neither response nor notification"),
        }
    }
}

/// Read one `Content-Length`-framed body. Returns `None` at end of stream.
pub(crate) async fn read_frame<R>(reader: &mut BufReader<R>) -> LspResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|_| {
                    LspError::protocol(format!("Invalid Content-Length: {}", value.trim()))
                })?;
                content_length = Some(parsed);
            }
            // Content-Type and unknown headers are ignored.
        }
    }

    let content_length =
        content_length.ok_or_else(|| LspError::protocol("Missing Content-Length header"))?;

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

impl Drop for Transport {
    fn drop(&mut self) {
        // The read task holds only an Arc of shared state; abort it so a
        // dropped transport does not leave a loop running.
        if let Ok(mut guard) = self.read_task.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcError;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// Build a transport wired to an in-process peer end.
    fn pair() -> (Transport, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (peer_read, peer_write) = tokio::io::split(theirs);
        (Transport::new(our_read, our_write), peer_read, peer_write)
    }

    async fn peer_read_frame(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Option<Value> {
        let body = read_frame(reader).await.ok().flatten()?;
        serde_json::from_slice(&body).ok()
    }

    async fn peer_write_frame(writer: &mut WriteHalf<DuplexStream>, body: &Value) {
        let body = serde_json::to_vec(body).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        writer.write_all(header.as_bytes()).await.unwrap();
        writer.write_all(&body).await.unwrap();
        writer.flush().await.unwrap();
    }

    fn response(id: u64, result: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    #[tokio::test]
    async fn test_correlation_out_of_order() {
        let (transport, peer_read, mut peer_write) = pair();
        let transport = Arc::new(transport);

        // Peer collects three requests, then answers them in reverse order,
        // echoing each request's method into its result.
        tokio::spawn(async move {
            let mut reader = BufReader::new(peer_read);
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(peer_read_frame(&mut reader).await.unwrap());
            }
            for request in requests.iter().rev() {
                let id = request["id"].as_u64().unwrap();
                let method = request["method"].as_str().unwrap();
                peer_write_frame(&mut peer_write, &response(id, json!({"echo": method}))).await;
            }
        });

        let timeout = Duration::from_secs(5);
        let (a, b, c) = tokio::join!(
            transport.call("alpha", None, timeout),
            transport.call("beta", None, timeout),
            transport.call("gamma", None, timeout),
        );

        assert_eq!(a.unwrap()["echo"], "alpha");
        assert_eq!(b.unwrap()["echo"], "beta");
        assert_eq!(c.unwrap()["echo"], "gamma");
        assert_eq!(transport.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_protocol_error_surfaced() {
        let (transport, peer_read, mut peer_write) = pair();

        tokio::spawn(async move {
            let mut reader = BufReader::new(peer_read);
            let request = peer_read_frame(&mut reader).await.unwrap();
            let id = request["id"].as_u64().unwrap();
            peer_write_frame(
                &mut peer_write,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                }),
            )
            .await;
        });

        let result = transport
            .call("unknown/method", None, Duration::from_secs(5))
            .await;
        match result {
            Err(LspError::Server { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_races_late_response_without_double_release() {
        let (transport, peer_read, mut peer_write) = pair();
        let transport = Arc::new(transport);

        tokio::spawn(async move {
            let mut reader = BufReader::new(peer_read);
            let request = peer_read_frame(&mut reader).await.unwrap();
            let id = request["id"].as_u64().unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            peer_write_frame(&mut peer_write, &response(id, json!("late"))).await;
        });

        let result = transport
            .call("slow", None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LspError::Timeout(_))));
        assert_eq!(transport.pending_len().await, 0);

        // The late response arrives after the caller abandoned the call; it
        // must be looked up, not found, and discarded.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.pending_len().await, 0);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_notification_dispatch_and_wildcard() {
        let (transport, _peer_read, mut peer_write) = pair();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let named_tx = tx.clone();
        transport
            .on_notification("textDocument/publishDiagnostics", move |method, _| {
                let _ = named_tx.send(format!("named:{method}"));
            })
            .await;
        transport
            .on_unhandled_notification(move |method, _| {
                let _ = tx.send(format!("wildcard:{method}"));
            })
            .await;

        peer_write_frame(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": "file:///a.rs", "diagnostics": []}
            }),
        )
        .await;
        peer_write_frame(
            &mut peer_write,
            &json!({"jsonrpc": "2.0", "method": "$/progress", "params": {}}),
        )
        .await;

        // Handlers run on their own tasks, so arrival order is not defined.
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "named:textDocument/publishDiagnostics".to_string(),
                "wildcard:$/progress".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_kill_read_loop() {
        let (transport, peer_read, mut peer_write) = pair();

        tokio::spawn(async move {
            let mut reader = BufReader::new(peer_read);
            // Garbage frame first, then a valid response.
            let garbage = b"{not json";
            let header = format!("Content-Length: {}\r\n\r\n", garbage.len());
            peer_write.write_all(header.as_bytes()).await.unwrap();
            peer_write.write_all(garbage).await.unwrap();
            peer_write.flush().await.unwrap();

            let request = peer_read_frame(&mut reader).await.unwrap();
            let id = request["id"].as_u64().unwrap();
            peer_write_frame(&mut peer_write, &response(id, json!("still alive"))).await;
        });

        let result = transport
            .call("anything", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!("still alive"));
    }

    #[tokio::test]
    async fn test_close_releases_pending_callers() {
        let (transport, _peer_read, _peer_write) = pair();
        let transport = Arc::new(transport);

        let caller = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .call("never/answered", None, Duration::from_secs(30))
                    .await
            })
        };

        // Give the call time to park in the pending table.
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await.unwrap();

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(LspError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _peer_read, _peer_write) = pair();
        assert!(transport.close().await.is_ok());
        assert!(transport.close().await.is_ok());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_call_and_notify_after_close() {
        let (transport, _peer_read, _peer_write) = pair();
        transport.close().await.unwrap();

        let call = transport.call("m", None, Duration::from_secs(1)).await;
        assert!(matches!(call, Err(LspError::Closed)));

        let notify = transport.notify("m", None).await;
        assert!(matches!(notify, Err(LspError::Closed)));
    }

    #[tokio::test]
    async fn test_notify_writes_frame_in_order() {
        let (transport, peer_read, _peer_write) = pair();
        let mut reader = BufReader::new(peer_read);

        for i in 0..5 {
            transport
                .notify("textDocument/didChange", Some(json!({"version": i})))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let frame = peer_read_frame(&mut reader).await.unwrap();
            assert_eq!(frame["method"], "textDocument/didChange");
            assert_eq!(frame["params"]["version"], i);
        }
    }

    #[test]
    fn test_error_object_round_trip() {
        let err = JsonRpcError {
            code: -32700,
            message: "parse error".to_string(),
            data: None,
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], -32700);
    }
}
