//! A single stdio JSON-RPC connection to one MCP server child.
//!
//! [`Connection`] owns the pending-request table, the next-id counter, and
//! the two background tasks (reader, timekeeper) that keep it alive. Writes
//! go straight to the child through a `tokio::sync::Mutex`-guarded
//! [`crate::protocol::transport::LineWriter`] rather than through a writer
//! task, since every write is already serialised by that mutex and the
//! extra hop would just cost a channel.
//!
//! Construction is generic over `AsyncRead + AsyncWrite` so tests can drive
//! a connection over `tokio::io::duplex` instead of a real child process.

pub mod pending;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ConnectionError;
use crate::protocol::transport::{LineReader, LineWriter};
use crate::protocol::{
    classify, IncomingMessage, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
    ParsedMessage, ProgressParams, RequestId, ToolDefinition, MCP_PROTOCOL_VERSION,
};

pub use pending::ProgressEvent;
use pending::{PendingEntry, PendingTable};

/// How often the timekeeper scans the pending table for expired deadlines.
const TIMEKEEPER_TICK: Duration = Duration::from_millis(250);

/// Information returned by a successful `initialize` handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: String,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub capabilities: Value,
}

/// Events a connection surfaces to its owning supervisor, independent of
/// any particular in-flight request.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The child announced `notifications/tools/list_changed`.
    ToolsListChanged,
    /// The reader hit EOF: the child closed its stdout, or the pipe broke.
    /// Per the stdin-close policy, this is treated identically to an
    /// observed process exit.
    Closed,
}

struct Shared<W> {
    writer: Mutex<LineWriter<W>>,
    pending: Mutex<PendingTable>,
    next_id: std::sync::atomic::AtomicU64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    default_call_timeout: Duration,
}

/// A live connection to one MCP server child's stdio pipes.
pub struct Connection<W> {
    shared: Arc<Shared<W>>,
    reader_task: JoinHandle<()>,
    timekeeper_task: JoinHandle<()>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Connection<W> {
    /// Spawns the reader and timekeeper tasks and returns a connection
    /// ready for `initialize`.
    ///
    /// `events_tx` receives [`ConnectionEvent`]s for the lifetime of the
    /// connection; the receiving end is typically owned by a supervisor.
    pub fn spawn<R>(
        stdin: W,
        stdout: R,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        default_call_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(LineWriter::new(stdin)),
            pending: Mutex::new(PendingTable::default()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            events_tx,
            default_call_timeout,
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(Self::reader_loop(reader_shared, stdout));

        let timekeeper_shared = Arc::clone(&shared);
        let timekeeper_task = tokio::spawn(Self::timekeeper_loop(timekeeper_shared));

        Self {
            shared,
            reader_task,
            timekeeper_task,
        }
    }

    async fn reader_loop<R>(shared: Arc<Shared<W>>, stdout: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = LineReader::new(stdout);
        loop {
            let line = match reader.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading from child, treating as closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let incoming: IncomingMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, line = %line, "malformed JSON-RPC line from child, skipping");
                    continue;
                }
            };
            match classify(incoming) {
                ParsedMessage::Response { id, outcome } => {
                    let mut pending = shared.pending.lock().await;
                    let outcome = outcome.map_err(|err| ConnectionError::ToolError {
                        message: err.message,
                        code: Some(err.code),
                    });
                    if !pending.resolve(&id, outcome) {
                        trace!(%id, "response for unknown or already-resolved request id");
                    }
                }
                ParsedMessage::Notification { method, params } => {
                    Self::handle_notification(&shared, &method, params).await;
                }
                ParsedMessage::UnmatchedId { id } => {
                    trace!(%id, "message with id but no method/result/error shape");
                }
            }
        }

        debug!("child stdout closed, rejecting all pending requests");
        shared
            .pending
            .lock()
            .await
            .reject_all(|| ConnectionError::ConnectionClosed);
        let _ = shared.events_tx.send(ConnectionEvent::Closed);
    }

    async fn handle_notification(shared: &Arc<Shared<W>>, method: &str, params: Option<Value>) {
        match method {
            "notifications/progress" => {
                let Some(params) = params else { return };
                let Ok(progress) = serde_json::from_value::<ProgressParams>(params) else {
                    return;
                };
                let Some(id) = value_to_request_id(&progress.progress_token) else {
                    return;
                };
                let event = ProgressEvent {
                    progress: progress.progress,
                    total: progress.total,
                    message: progress.message,
                };
                let mut pending = shared.pending.lock().await;
                pending.on_progress(&id, event, Instant::now(), shared.default_call_timeout);
            }
            "notifications/tools/list_changed" => {
                let _ = shared.events_tx.send(ConnectionEvent::ToolsListChanged);
            }
            other => {
                trace!(method = %other, "ignoring unrecognised notification from child");
            }
        }
    }

    async fn timekeeper_loop(shared: Arc<Shared<W>>) {
        let mut interval = tokio::time::interval(TIMEKEEPER_TICK);
        loop {
            interval.tick().await;
            let expired = shared.pending.lock().await.take_expired(Instant::now());
            for id in expired {
                trace!(%id, "request timed out");
                Self::send_cancel_notification(&shared, &id).await;
            }
        }
    }

    /// Writes the `notifications/cancelled` line for `id`. Used both for an
    /// explicit client cancel and for a deadline expiring in the timekeeper;
    /// the pending entry itself is already resolved by the caller before
    /// this runs, so a failed write here just means the child never learns
    /// the request is moot.
    async fn send_cancel_notification(shared: &Arc<Shared<W>>, id: &RequestId) {
        let notification = JsonRpcNotification::new(
            "notifications/cancelled",
            Some(json!({ "requestId": id_to_value(id) })),
        );
        let _ = shared.writer.lock().await.write_message(&notification).await;
    }

    fn alloc_id(&self) -> RequestId {
        RequestId::Number(
            self.shared
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }

    /// Sends a request, registers it in the pending table, and waits for
    /// its terminal result or the given deadline.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
        id_sink: Option<oneshot::Sender<RequestId>>,
    ) -> Result<Value, ConnectionError> {
        let id = self.alloc_id();
        if let Some(id_sink) = id_sink {
            let _ = id_sink.send(id.clone());
        }
        let (result_tx, result_rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().await;
            if pending.is_closed() {
                return Err(ConnectionError::ConnectionClosed);
            }
            pending.insert(
                id.clone(),
                PendingEntry {
                    result_tx: Some(result_tx),
                    progress_sink,
                    deadline: Instant::now() + deadline,
                    reset_deadline_on_progress,
                },
            );
        }

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self
            .shared
            .writer
            .lock()
            .await
            .write_message(&request)
            .await
        {
            let mut pending = self.shared.pending.lock().await;
            pending.resolve(&id, Err(ConnectionError::Io(e)));
        }

        result_rx.await.unwrap_or(Err(ConnectionError::ConnectionClosed))
    }

    /// Performs the MCP `initialize` handshake.
    ///
    /// Fails the handshake outright if the child responds with a protocol
    /// version we did not offer and do not otherwise recognise, per the
    /// design document's strict version check.
    pub async fn initialize(&self, deadline: Duration) -> Result<ServerHandshake, ConnectionError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": crate::protocol::CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .request("initialize", Some(params), deadline, None, false, None)
            .await?;

        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectionError::HandshakeFailed {
                reason: "missing protocolVersion in initialize result".to_string(),
            })?
            .to_string();

        let server_info = result.get("serverInfo");
        let server_name = server_info
            .and_then(|si| si.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let server_version = server_info
            .and_then(|si| si.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);

        self.notify_initialized().await?;

        Ok(ServerHandshake {
            protocol_version,
            server_name,
            server_version,
            capabilities,
        })
    }

    async fn notify_initialized(&self) -> Result<(), ConnectionError> {
        let notification = JsonRpcNotification::new("notifications/initialized", None);
        self.shared
            .writer
            .lock()
            .await
            .write_message(&notification)
            .await
            .map_err(ConnectionError::Io)
    }

    /// Lists every tool the child offers, following `nextCursor` pagination
    /// until the child stops returning one.
    pub async fn list_tools(&self, deadline: Duration) -> Result<Vec<ToolDefinition>, ConnectionError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map(|c| json!({ "cursor": c }));
            let result = self
                .request("tools/list", params, deadline, None, false, None)
                .await?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                ConnectionError::ProtocolError {
                    reason: format!("malformed tools/list result: {e}"),
                }
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    /// Calls a tool by name, optionally streaming progress notifications to
    /// `progress_sink` and optionally resetting the call's deadline every
    /// time progress is observed (the caller decides this per call; the
    /// router sets it to `true` only when the client did not supply its own
    /// timeout override).
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
        id_sink: Option<oneshot::Sender<RequestId>>,
    ) -> Result<Value, ConnectionError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request(
            "tools/call",
            Some(params),
            deadline,
            progress_sink,
            reset_deadline_on_progress,
            id_sink,
        )
        .await
    }

    /// Sends `notifications/cancelled` for `id` and immediately rejects the
    /// pending entry locally; the child's eventual response, if any, is
    /// dropped by `reader_loop` as an unmatched id.
    pub async fn cancel(&self, id: &RequestId) {
        let mut pending = self.shared.pending.lock().await;
        pending.resolve(id, Err(ConnectionError::Cancelled));
        drop(pending);
        Self::send_cancel_notification(&self.shared, id).await;
    }

    /// Closes the connection: rejects every pending request, shuts down the
    /// writer half, and stops the background tasks.
    pub async fn close(self) {
        self.shared
            .pending
            .lock()
            .await
            .reject_all(|| ConnectionError::ConnectionClosed);
        let _ = self.shared.writer.lock().await.shutdown().await;
        self.reader_task.abort();
        self.timekeeper_task.abort();
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => json!(n),
        RequestId::String(s) => json!(s),
    }
}

fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(n) = value.as_u64() {
        Some(RequestId::Number(n))
    } else {
        value.as_str().map(|s| RequestId::String(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Spawns a `Connection` over an in-memory duplex pipe and returns it
    /// alongside the "child side" handles a test can drive directly.
    fn fake_child() -> (
        Connection<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (daemon_side, child_side) = tokio::io::duplex(8192);
        let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
        let (child_read, child_write) = tokio::io::split(child_side);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(daemon_write, daemon_read, events_tx, Duration::from_secs(30));
        (conn, child_read, child_write, events_rx)
    }

    async fn read_request_line(child_read: &mut tokio::io::ReadHalf<tokio::io::DuplexStream>) -> Value {
        let mut reader = LineReader::new(&mut *child_read);
        let line = reader.read_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn initialize_round_trip() {
        let (conn, mut child_read, mut child_write, _events) = fake_child();

        let init_fut = conn.initialize(Duration::from_secs(5));
        let handle = tokio::spawn(async move {
            let req = read_request_line(&mut child_read).await;
            assert_eq!(req["method"], "initialize");
            let id = req["id"].clone();
            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "serverInfo": {"name": "fake", "version": "0.1.0"},
                },
            });
            let mut writer = LineWriter::new(&mut child_write);
            writer.write_message(&response).await.unwrap();
            // drain the notifications/initialized line so the test doesn't hang
            let mut reader = LineReader::new(&mut child_read);
            let line = reader.read_line().await.unwrap().unwrap();
            assert!(line.contains("notifications/initialized"));
        });

        let handshake = init_fut.await.unwrap();
        assert_eq!(handshake.protocol_version, MCP_PROTOCOL_VERSION);
        assert_eq!(handshake.server_name.as_deref(), Some("fake"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn list_tools_follows_cursor_pagination() {
        let (conn, mut child_read, mut child_write, _events) = fake_child();

        let list_fut = conn.list_tools(Duration::from_secs(5));
        let handle = tokio::spawn(async move {
            let req = read_request_line(&mut child_read).await;
            assert_eq!(req["method"], "tools/list");
            let id = req["id"].clone();
            let mut writer = LineWriter::new(&mut child_write);
            writer
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [{"name": "a", "inputSchema": {}}], "nextCursor": "page2"},
                }))
                .await
                .unwrap();

            let req2 = read_request_line(&mut child_read).await;
            assert_eq!(req2["params"]["cursor"], "page2");
            let id2 = req2["id"].clone();
            writer
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "id": id2,
                    "result": {"tools": [{"name": "b", "inputSchema": {}}]},
                }))
                .await
                .unwrap();
        });

        let tools = list_fut.await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "a");
        assert_eq!(tools[1].name, "b");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn call_tool_reports_tool_error() {
        let (conn, mut child_read, mut child_write, _events) = fake_child();

        let call_fut = conn.call_tool("boom", json!({}), Duration::from_secs(5), None, false, None);
        let handle = tokio::spawn(async move {
            let req = read_request_line(&mut child_read).await;
            let id = req["id"].clone();
            let mut writer = LineWriter::new(&mut child_write);
            writer
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "tool blew up"},
                }))
                .await
                .unwrap();
        });

        let err = call_fut.await.unwrap_err();
        assert!(matches!(err, ConnectionError::ToolError { .. }));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn call_tool_receives_progress_before_terminal_response() {
        let (conn, mut child_read, mut child_write, _events) = fake_child();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let call_fut = conn.call_tool(
            "slow",
            json!({}),
            Duration::from_secs(5),
            Some(progress_tx),
            false,
            None,
        );
        let handle = tokio::spawn(async move {
            let req = read_request_line(&mut child_read).await;
            let id = req["id"].clone();
            let mut writer = LineWriter::new(&mut child_write);
            writer
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": id, "progress": 0.5, "message": "halfway"},
                }))
                .await
                .unwrap();
            writer
                .write_message(&json!({"jsonrpc": "2.0", "id": id, "result": {"done": true}}))
                .await
                .unwrap();
        });

        let progress = progress_rx.recv().await.unwrap();
        assert_eq!(progress.progress, 0.5);
        assert_eq!(progress.message.as_deref(), Some("halfway"));

        let result = call_fut.await.unwrap();
        assert_eq!(result["done"], true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn child_eof_rejects_pending_and_emits_closed_event() {
        let (conn, child_read, child_write, mut events) = fake_child();
        drop(child_write);
        drop(child_read);

        let result = conn
            .call_tool("whatever", json!({}), Duration::from_secs(5), None, false, None)
            .await;
        assert!(matches!(result, Err(ConnectionError::ConnectionClosed)));

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Closed));
    }

    #[tokio::test]
    async fn request_times_out_when_child_never_replies() {
        let (conn, _child_read, _child_write, _events) = fake_child();
        let result = conn
            .call_tool("never", json!({}), Duration::from_millis(50), None, false, None)
            .await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
    }

    #[tokio::test]
    async fn expired_request_notifies_the_child_of_cancellation() {
        let (conn, mut child_read, _child_write, _events) = fake_child();
        let result = conn
            .call_tool("never", json!({}), Duration::from_millis(50), None, false, None)
            .await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));

        let mut reader = LineReader::new(&mut child_read);
        let line = reader.read_line().await.unwrap().unwrap();
        let notification: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(notification["method"], "notifications/cancelled");
    }
}
