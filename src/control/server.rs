//! The control-plane Unix socket server.
//!
//! One task per accepted client connection; within a connection, each
//! request is dispatched onto its own task so a slow `tool_call` never
//! blocks other requests made on the same connection. Responses (and any
//! `progress` envelopes) are serialised onto the connection's writer
//! through a shared lock so concurrent tasks never interleave partial
//! lines.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

use crate::connection::ProgressEvent;
use crate::control::protocol::{ControlRequest, ControlResponse, ProgressPayload};
use crate::error::{DaemonError, ErrorKind};
use crate::protocol::transport::{LineReader, LineWriter};
use crate::protocol::RequestId;
use crate::router::Router;

/// The server-side half of an in-flight `tool_call`: the task dispatching
/// it, and a cell that fills in with the child-bound `(server_id,
/// RequestId)` once one is allocated, so a later `cancel_call` can forward
/// real cancellation to the child instead of only aborting our own task.
struct InFlight {
    abort: AbortHandle,
    cancel_target: Arc<Mutex<Option<(String, RequestId)>>>,
}

/// Binds the control socket, removing a stale one left behind by a daemon
/// that did not shut down cleanly.
///
/// A socket path that already exists is only ever removed after a failed
/// connection attempt proves nothing is listening on it — never
/// unconditionally, since that would let a fresh daemon silently steal the
/// socket out from under a live one.
pub async fn bind(path: &Path) -> Result<UnixListener, DaemonError> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::AlreadyRunning {
                pid_file: path.to_path_buf(),
            });
        }
        std::fs::remove_file(path).map_err(|e| DaemonError::SocketBindFailed {
            path: path.to_path_buf(),
            reason: format!("failed to remove stale socket: {e}"),
        })?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::SocketBindFailed {
            path: path.to_path_buf(),
            reason: format!("failed to create socket directory: {e}"),
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|e| DaemonError::SocketBindFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        DaemonError::SocketBindFailed {
            path: path.to_path_buf(),
            reason: format!("failed to set socket permissions: {e}"),
        }
    })?;

    Ok(listener)
}

/// Drives the accept loop until `shutdown` carries `true`.
///
/// `shutdown` is a `watch::Sender` rather than a `Receiver` because a
/// client's `shutdown` control request must be able to *originate* the
/// signal, not just observe it; the daemon's own signal handler and this
/// function race to flip the same channel.
pub async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    router: Arc<Router>,
    shutdown: watch::Sender<bool>,
    default_call_timeout: Duration,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let router = Arc::clone(&router);
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_connection(stream, router, shutdown, default_call_timeout));
                    }
                    Err(e) => warn!(error = %e, "failed to accept control connection"),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("control server shutting down, no longer accepting connections");
                    break;
                }
            }
        }
    }
    let _ = std::fs::remove_file(&socket_path);
}

#[instrument(skip(stream, router, shutdown))]
async fn handle_connection(
    stream: UnixStream,
    router: Arc<Router>,
    shutdown: watch::Sender<bool>,
    default_call_timeout: Duration,
) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(LineWriter::new(write_half)));
    let mut reader = LineReader::new(read_half);
    let in_flight: Arc<Mutex<HashMap<String, InFlight>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "control connection read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = ControlResponse::error_with_kind(
                    "unknown",
                    format!("malformed request: {e}"),
                    ErrorKind::ProtocolError,
                );
                write_response(&writer, &response).await;
                continue;
            }
        };

        if let ControlRequest::Shutdown { request_id } = &request {
            let response = ControlResponse::success(request_id.clone(), json!({"shutting_down": true}));
            write_response(&writer, &response).await;
            let _ = shutdown.send(true);
            continue;
        }

        if let ControlRequest::CancelCall { request_id, target_request_id } = &request {
            let entry = in_flight.lock().await.remove(target_request_id);
            let cancelled = entry.is_some();
            if let Some(entry) = entry {
                entry.abort.abort();
                forward_cancel(&router, &entry.cancel_target).await;
            }
            let response = ControlResponse::success(request_id.clone(), json!({"cancelled": cancelled}));
            write_response(&writer, &response).await;
            continue;
        }

        let router_for_spawn = Arc::clone(&router);
        let writer = Arc::clone(&writer);
        let in_flight_for_spawn = Arc::clone(&in_flight);
        let request_id = request.request_id().to_string();
        let cancel_target: Arc<Mutex<Option<(String, RequestId)>>> = Arc::new(Mutex::new(None));
        let cancel_target_for_spawn = Arc::clone(&cancel_target);

        let task = tokio::spawn(async move {
            let response = dispatch(&request, &router_for_spawn, &writer, default_call_timeout, cancel_target_for_spawn).await;
            write_response(&writer, &response).await;
        });
        in_flight_for_spawn.lock().await.insert(
            request_id,
            InFlight {
                abort: task.abort_handle(),
                cancel_target,
            },
        );
    }

    // The client disconnected (or the read loop errored out); nothing will
    // ever cancel these on its own, so sweep them here instead of leaving
    // their child-side calls running forever.
    let remaining: Vec<InFlight> = in_flight.lock().await.drain().map(|(_, entry)| entry).collect();
    for entry in remaining {
        entry.abort.abort();
        forward_cancel(&router, &entry.cancel_target).await;
    }
}

async fn forward_cancel(router: &Arc<Router>, cancel_target: &Arc<Mutex<Option<(String, RequestId)>>>) {
    let target = cancel_target.lock().await.clone();
    if let Some((server_id, child_id)) = target {
        if let Some(supervisor) = router.supervisor(&server_id) {
            supervisor.cancel_call(&child_id).await;
        }
    }
}

async fn dispatch<W>(
    request: &ControlRequest,
    router: &Arc<Router>,
    writer: &Arc<Mutex<LineWriter<W>>>,
    default_call_timeout: Duration,
    cancel_target: Arc<Mutex<Option<(String, RequestId)>>>,
) -> ControlResponse
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    match request {
        ControlRequest::ToolCall {
            request_id,
            server_id,
            tool_name,
            args,
            timeout,
        } => {
            let (deadline, reset_on_progress) = match timeout {
                Some(ms) => (Duration::from_millis(*ms), false),
                None => (default_call_timeout, true),
            };
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
            let forward_writer = Arc::clone(writer);
            let forward_request_id = request_id.clone();
            let forward_task = tokio::spawn(async move {
                let mut step: i64 = 0;
                while let Some(event) = progress_rx.recv().await {
                    step += 1;
                    let response = ControlResponse::Progress {
                        request_id: forward_request_id.clone(),
                        progress: ProgressPayload {
                            message: event.message,
                            step: Some(step),
                            #[allow(clippy::cast_possible_truncation)]
                            total: event.total.map(|t| t.round() as i64),
                        },
                    };
                    write_response(&forward_writer, &response).await;
                }
            });

            let (id_tx, id_rx) = oneshot::channel();
            let fill_task = {
                let cancel_target = Arc::clone(&cancel_target);
                tokio::spawn(async move {
                    if let Ok(target) = id_rx.await {
                        *cancel_target.lock().await = Some(target);
                    }
                })
            };

            let result = router
                .call_tool_cancellable(
                    server_id.as_deref(),
                    tool_name,
                    args.clone(),
                    deadline,
                    Some(progress_tx),
                    reset_on_progress,
                    id_tx,
                )
                .await;
            forward_task.abort();
            fill_task.abort();

            match result {
                Ok(value) => ControlResponse::success(request_id.clone(), value),
                Err(e) => {
                    let daemon_error = DaemonError::from(e);
                    ControlResponse::error(request_id.clone(), &daemon_error)
                }
            }
        }
        ControlRequest::ListTools { request_id, server_id } => {
            let tools = router.list_tools().await;
            let collisions = router.collisions().await;
            let tools = tools
                .iter()
                .filter(|t| server_id.as_deref().map_or(true, |filter| t.server_id == filter));
            let result = json!({
                "tools": tools.map(|t| json!({
                    "name": t.name,
                    "qualified_name": t.qualified_name(),
                    "server_id": t.server_id,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })).collect::<Vec<_>>(),
                "collisions": collisions.iter().map(|c| json!({
                    "tool_name": c.tool_name,
                    "canonical_server_id": c.canonical.server_id,
                    "shadowed": c.others.iter().map(|t| t.server_id.clone()).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            });
            ControlResponse::success(request_id.clone(), result)
        }
        ControlRequest::ServerStatus { request_id, server_id } => {
            match router.supervisor(server_id) {
                Some(supervisor) => {
                    let result = json!({
                        "server_id": server_id,
                        "state": supervisor.state().as_str(),
                    });
                    ControlResponse::success(request_id.clone(), result)
                }
                None => ControlResponse::error_with_kind(
                    request_id.clone(),
                    format!("unknown server: {server_id}"),
                    ErrorKind::UnknownServer,
                ),
            }
        }
        ControlRequest::DaemonStatus { request_id } => {
            let server_ids = router.server_ids();
            let mut servers = Vec::with_capacity(server_ids.len());
            for server_id in &server_ids {
                if let Some(supervisor) = router.supervisor(server_id) {
                    servers.push(json!({
                        "server_id": server_id,
                        "state": supervisor.state().as_str(),
                    }));
                }
            }
            let result = json!({
                "servers": servers,
                "tool_count": router.list_tools().await.len(),
            });
            ControlResponse::success(request_id.clone(), result)
        }
        ControlRequest::StartServer { request_id, server_id } => {
            match router.supervisor(server_id) {
                Some(supervisor) => match supervisor.ensure_ready().await {
                    Ok(()) => {
                        if let Err(e) = router.refresh_tools(server_id).await {
                            warn!(server_id, error = %e, "post-start tool discovery failed");
                        }
                        ControlResponse::success(request_id.clone(), json!({"state": supervisor.state().as_str()}))
                    }
                    Err(e) => ControlResponse::error(request_id.clone(), &DaemonError::from(e)),
                },
                None => ControlResponse::error_with_kind(
                    request_id.clone(),
                    format!("unknown server: {server_id}"),
                    ErrorKind::UnknownServer,
                ),
            }
        }
        ControlRequest::StopServer { request_id, server_id } => {
            match router.supervisor(server_id) {
                Some(supervisor) => {
                    supervisor.stop(true).await;
                    router.drop_tools(server_id).await;
                    ControlResponse::success(request_id.clone(), json!({"state": supervisor.state().as_str()}))
                }
                None => ControlResponse::error_with_kind(
                    request_id.clone(),
                    format!("unknown server: {server_id}"),
                    ErrorKind::UnknownServer,
                ),
            }
        }
        ControlRequest::CancelCall { request_id, .. } | ControlRequest::Shutdown { request_id } => {
            // Handled inline in handle_connection before dispatch() is called.
            ControlResponse::error_with_kind(request_id.clone(), "internal dispatch error", ErrorKind::Internal)
        }
    }
}

async fn write_response<W>(writer: &Arc<Mutex<LineWriter<W>>>, response: &ControlResponse)
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = writer.lock().await.write_message(response).await {
        warn!(error = %e, "failed to write control response");
    }
}
