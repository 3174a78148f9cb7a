//! Supervises one configured MCP server: spawning its process, performing
//! the handshake, watching it for exit or staleness, and restarting it
//! according to the configured backoff policy.
//!
//! Each [`Supervisor`] owns one background lifecycle task, started at
//! construction and running for the supervisor's whole life. The task
//! sits idle until [`Supervisor::ensure_ready`] raises the `target_running`
//! flag, spawns the child, republishes state changes over a `watch`
//! channel, and loops on exit according to the restart policy — this
//! mirrors the way the reference git proxy spawns `git` via
//! `tokio::process::Command` with piped stdio, generalised here to a
//! long-lived child instead of a one-shot command.

mod state;

pub use state::SupervisorState;

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{info, instrument, warn};

use crate::config::ServerSpec;
use crate::config::{DaemonSettings, RestartPolicyConfig};
use crate::connection::{Connection, ConnectionEvent, ProgressEvent};
use crate::error::SupervisorError;
use crate::protocol::{RequestId, ToolDefinition};
use state::Backoff;

const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive health-check failures tolerated while `Ready` before moving
/// to `Degraded`. Any further failure while already `Degraded` escalates
/// straight to a restart.
const HEALTH_CHECK_FAILURE_THRESHOLD: u32 = 2;

/// Events a supervisor emits for consumption by [`crate::router::Router`]
/// and the daemon's logging layer.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged { server_id: String, state: SupervisorState },
    ToolsChanged { server_id: String },
    Exited { server_id: String, code: Option<i32> },
}

struct RunningChild {
    child: Child,
    connection: Arc<Connection<tokio::process::ChildStdin>>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

struct Shared {
    server_id: String,
    spec: ServerSpec,
    settings: Arc<DaemonSettings>,
    state_tx: watch::Sender<SupervisorState>,
    connection_slot: RwLock<Option<Arc<Connection<tokio::process::ChildStdin>>>>,
    last_error: RwLock<Option<String>>,
    last_activity: AtomicI64,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Shared {
    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
        let _ = self.events_tx.send(SupervisorEvent::StateChanged {
            server_id: self.server_id.clone(),
            state,
        });
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

fn now_millis() -> i64 {
    // Using a monotonic-ish wall clock stand-in: the daemon only ever
    // compares deltas of this value against itself within one process
    // lifetime, so clock skew across restarts is irrelevant.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Owns one supervised child's lifecycle.
pub struct Supervisor {
    shared: Arc<Shared>,
    target_running_tx: watch::Sender<bool>,
    lifecycle_task: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        server_id: String,
        spec: ServerSpec,
        settings: Arc<DaemonSettings>,
        events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);
        let (target_running_tx, target_running_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            server_id,
            spec,
            settings,
            state_tx,
            connection_slot: RwLock::new(None),
            last_error: RwLock::new(None),
            last_activity: AtomicI64::new(now_millis()),
            events_tx,
        });

        let lifecycle_shared = Arc::clone(&shared);
        let lifecycle_task = tokio::spawn(lifecycle_loop(lifecycle_shared, target_running_rx));

        Self {
            shared,
            target_running_tx,
            lifecycle_task,
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    #[must_use]
    pub fn autostart(&self) -> bool {
        self.shared.spec.autostart
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.shared.spec.priority
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.shared.state_tx.borrow()
    }

    /// Brings the server to `Ready`, starting it if necessary, and waits
    /// until that happens or the restart policy gives up.
    #[instrument(skip(self), fields(server_id = %self.shared.server_id))]
    pub async fn ensure_ready(&self) -> Result<(), SupervisorError> {
        let mut rx = self.shared.state_tx.subscribe();
        if matches!(*rx.borrow(), SupervisorState::Ready | SupervisorState::Degraded) {
            return Ok(());
        }

        let _ = self.target_running_tx.send(true);

        loop {
            let current_state = *rx.borrow();
            match current_state {
                SupervisorState::Ready | SupervisorState::Degraded => return Ok(()),
                SupervisorState::Error => {
                    let reason = self
                        .shared
                        .last_error
                        .read()
                        .await
                        .clone()
                        .unwrap_or_else(|| "see daemon logs".to_string());
                    return Err(SupervisorError::StartFailed {
                        server_id: self.shared.server_id.clone(),
                        reason,
                    });
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(SupervisorError::NotReady {
                    server_id: self.shared.server_id.clone(),
                });
            }
        }
    }

    /// Lists the tools currently offered by this server. Fails with
    /// `NotReady` if no connection is established.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError> {
        let conn = self.connection().await?;
        self.shared.touch();
        Ok(conn.list_tools(LIST_TOOLS_TIMEOUT).await?)
    }

    /// Calls a tool against this server's live connection.
    ///
    /// `id_sink`, if given, receives the connection-level [`RequestId`] as
    /// soon as it is allocated, so a caller that needs to cancel the call
    /// later (the control plane does, to implement client-initiated
    /// cancellation) does not have to wait for the call to finish first.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
        id_sink: Option<oneshot::Sender<RequestId>>,
    ) -> Result<Value, SupervisorError> {
        let conn = self.connection().await?;
        self.shared.touch();
        Ok(conn
            .call_tool(name, arguments, deadline, progress_sink, reset_deadline_on_progress, id_sink)
            .await?)
    }

    /// Forwards a cancellation for a previously-issued child request id.
    /// A no-op if the connection has already gone away.
    pub async fn cancel_call(&self, id: &RequestId) {
        if let Ok(conn) = self.connection().await {
            conn.cancel(id).await;
        }
    }

    async fn connection(&self) -> Result<Arc<Connection<tokio::process::ChildStdin>>, SupervisorError> {
        self.shared
            .connection_slot
            .read()
            .await
            .clone()
            .ok_or_else(|| SupervisorError::NotReady {
                server_id: self.shared.server_id.clone(),
            })
    }

    /// Stops the server. When `graceful` is `true`, the lifecycle task
    /// sends `SIGTERM` and gives the child a chance to exit on its own
    /// before the process is killed on drop.
    pub async fn stop(&self, graceful: bool) {
        if !graceful {
            self.shared.set_state(SupervisorState::Stopping);
        }
        let _ = self.target_running_tx.send(false);

        let mut rx = self.shared.state_tx.subscribe();
        let wait = async {
            while *rx.borrow() != SupervisorState::Stopped {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(10), wait).await;
    }

    pub fn abort(&self) {
        self.lifecycle_task.abort();
    }
}

async fn lifecycle_loop(shared: Arc<Shared>, mut target_running_rx: watch::Receiver<bool>) {
    let mut backoff = shared.settings.restart_policy.backoff();

    loop {
        if !*target_running_rx.borrow() {
            shared.set_state(SupervisorState::Stopped);
            if target_running_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        shared.set_state(SupervisorState::Starting);
        match spawn_and_handshake(&shared).await {
            Ok(running) => {
                backoff.reset();
                *shared.connection_slot.write().await = Some(Arc::clone(&running.connection));
                shared.set_state(SupervisorState::Ready);

                let exit = run_until_exit(&shared, running, &mut target_running_rx).await;
                *shared.connection_slot.write().await = None;

                if !*target_running_rx.borrow() {
                    shared.set_state(SupervisorState::Stopped);
                    continue;
                }

                let _ = shared.events_tx.send(SupervisorEvent::Exited {
                    server_id: shared.server_id.clone(),
                    code: exit,
                });

                if backoff.failures + 1 >= shared.settings.restart_policy.max_restarts {
                    *shared.last_error.write().await =
                        Some(format!("exceeded {} restart attempts", shared.settings.restart_policy.max_restarts));
                    shared.set_state(SupervisorState::Error);
                    wait_for_target_toggle(&mut target_running_rx).await;
                    continue;
                }

                let delay = backoff.next_delay();
                warn!(server_id = %shared.server_id, delay = ?delay, "restarting after unexpected exit");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                *shared.last_error.write().await = Some(e.to_string());
                if backoff.failures + 1 >= shared.settings.restart_policy.max_restarts {
                    shared.set_state(SupervisorState::Error);
                    wait_for_target_toggle(&mut target_running_rx).await;
                    continue;
                }
                let delay = backoff.next_delay();
                warn!(server_id = %shared.server_id, error = %e, delay = ?delay, "start failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Waits for `target_running` to become `false` then `true` again, i.e.
/// an explicit stop followed by a fresh `ensure_ready` call. This is how a
/// server in `Error` leaves that state: only a deliberate restart request
/// clears it, never the backoff loop on its own.
async fn wait_for_target_toggle(target_running_rx: &mut watch::Receiver<bool>) {
    while *target_running_rx.borrow() {
        if target_running_rx.changed().await.is_err() {
            return;
        }
    }
    while !*target_running_rx.borrow() {
        if target_running_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn spawn_and_handshake(shared: &Arc<Shared>) -> Result<RunningChild, SupervisorError> {
    let mut command = Command::new(&shared.spec.command);
    command
        .args(&shared.spec.args)
        .envs(&shared.spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = &shared.spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|e| SupervisorError::StartFailed {
        server_id: shared.server_id.clone(),
        reason: format!("failed to spawn '{}': {e}", shared.spec.command),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| SupervisorError::StartFailed {
        server_id: shared.server_id.clone(),
        reason: "child did not expose a stdin pipe".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| SupervisorError::StartFailed {
        server_id: shared.server_id.clone(),
        reason: "child did not expose a stdout pipe".to_string(),
    })?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = Connection::spawn(stdin, stdout, events_tx, shared.settings.default_call_timeout());

    let handshake_timeout = shared.settings.handshake_timeout();
    match connection.initialize(handshake_timeout).await {
        Ok(handshake) => {
            info!(
                server_id = %shared.server_id,
                server_name = ?handshake.server_name,
                protocol_version = %handshake.protocol_version,
                "handshake complete"
            );
        }
        Err(e) => {
            let _ = child.start_kill();
            return Err(SupervisorError::StartFailed {
                server_id: shared.server_id.clone(),
                reason: e.to_string(),
            });
        }
    }

    Ok(RunningChild {
        child,
        connection: Arc::new(connection),
        events_rx,
    })
}

/// Runs while the child is `Ready`, handling exit, tools-changed
/// notifications, and the idle reap. Returns the child's exit code, if
/// known, once it is no longer running.
async fn run_until_exit(
    shared: &Arc<Shared>,
    mut running: RunningChild,
    target_running_rx: &mut watch::Receiver<bool>,
) -> Option<i32> {
    let idle_timeout = shared.spec.idle_timeout();
    let health_check_interval = shared.settings.health_check_interval();
    let mut health_check_failures: u32 = 0;

    loop {
        let idle_check = tokio::time::sleep(Duration::from_secs(1));
        let health_check = async {
            let tool = shared.spec.health_check_tool.as_ref()?;
            tokio::time::sleep(health_check_interval).await;
            Some(tool.clone())
        };

        tokio::select! {
            status = running.child.wait() => {
                return status.ok().and_then(|s| s.code());
            }
            event = running.events_rx.recv() => {
                match event {
                    Some(ConnectionEvent::ToolsListChanged) => {
                        let _ = shared.events_tx.send(SupervisorEvent::ToolsChanged {
                            server_id: shared.server_id.clone(),
                        });
                    }
                    Some(ConnectionEvent::Closed) | None => {
                        // Stdin-close policy: unsolicited stdout EOF is
                        // treated exactly like a process exit, even if the
                        // process itself lingers.
                        let _ = running.child.start_kill();
                        let status = running.child.wait().await;
                        return status.ok().and_then(|s| s.code());
                    }
                }
            }
            changed = target_running_rx.changed() => {
                if changed.is_err() || !*target_running_rx.borrow() {
                    graceful_stop(&mut running.child).await;
                    return None;
                }
            }
            () = idle_check, if !idle_timeout.is_zero() => {
                let last = shared.last_activity.load(Ordering::Relaxed);
                let idle_for = now_millis().saturating_sub(last);
                if idle_for >= i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX) {
                    info!(server_id = %shared.server_id, "idle timeout reached, stopping server");
                    graceful_stop(&mut running.child).await;
                    return None;
                }
            }
            Some(tool) = health_check => {
                match running.connection.call_tool(&tool, json!({}), HEALTH_CHECK_TIMEOUT, None, false, None).await {
                    Ok(_) => {
                        if *shared.state_tx.borrow() == SupervisorState::Degraded {
                            info!(server_id = %shared.server_id, "health check recovered");
                            shared.set_state(SupervisorState::Ready);
                        }
                        health_check_failures = 0;
                    }
                    Err(e) => {
                        health_check_failures += 1;
                        warn!(
                            server_id = %shared.server_id,
                            error = %e,
                            failures = health_check_failures,
                            "health check failed"
                        );
                        if *shared.state_tx.borrow() == SupervisorState::Degraded {
                            warn!(server_id = %shared.server_id, "health check failed again while degraded, restarting");
                            graceful_stop(&mut running.child).await;
                            return None;
                        }
                        if health_check_failures >= HEALTH_CHECK_FAILURE_THRESHOLD {
                            shared.set_state(SupervisorState::Degraded);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn graceful_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(id) = child.id() {
        let pid = i32::try_from(id).unwrap_or(i32::MAX);
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    let grace = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    if grace.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn graceful_stop(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

impl RestartPolicyConfig {
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff(), self.max_backoff())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> ServerSpec {
        ServerSpec {
            server_id: "echo".to_string(),
            description: None,
            command: "cat".to_string(),
            args: vec![],
            env: std::collections::HashMap::new(),
            cwd: None,
            priority: 0,
            autostart: false,
            idle_timeout: "10m".to_string(),
            health_check_tool: None,
        }
    }

    fn test_settings() -> Arc<DaemonSettings> {
        Arc::new(DaemonSettings::default())
    }

    #[tokio::test]
    async fn unstarted_supervisor_is_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new("echo".to_string(), test_spec(), test_settings(), tx);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        supervisor.abort();
    }

    #[tokio::test]
    async fn spawn_failure_reports_start_failed() {
        let mut spec = test_spec();
        spec.command = "/definitely/not/a/real/binary".to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut settings = DaemonSettings::default();
        settings.restart_policy.max_restarts = 1;
        let supervisor = Supervisor::new("echo".to_string(), spec, Arc::new(settings), tx);

        let result = supervisor.ensure_ready().await;
        assert!(matches!(result, Err(SupervisorError::StartFailed { .. })));
        supervisor.abort();
    }
}
