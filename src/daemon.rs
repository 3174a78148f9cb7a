//! Process bootstrap: configuration loading, supervisor construction,
//! the control socket, signal handling, and the shutdown sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::{load_config, DaemonSettings};
use crate::control;
use crate::error::DaemonError;
use crate::router::Router;
use crate::supervisor::{Supervisor, SupervisorEvent};

/// Command-line overrides layered on top of the configuration file.
pub struct DaemonOptions {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

/// An `O_EXCL`-locked PID file, removed when dropped.
///
/// Mirrors the reference daemon's approach of using filesystem exclusivity
/// rather than an advisory lock: simpler, and sufficient for a single
/// local daemon instance.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn acquire(path: PathBuf) -> Result<Self, DaemonError> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaemonError::SocketBindFailed {
                path: path.clone(),
                reason: format!("failed to create pid file directory: {e}"),
            })?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| DaemonError::AlreadyRunning { pid_file: path.clone() })?;

        write!(file, "{}", std::process::id()).map_err(|e| DaemonError::SocketBindFailed {
            path: path.clone(),
            reason: format!("failed to write pid file: {e}"),
        })?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Loads configuration, starts every autostart server, serves the control
/// socket, and blocks until a shutdown is requested (by signal or by a
/// client's `shutdown` control request), then tears everything down.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let config = load_config(options.config_path.as_deref())?;
    let settings = Arc::new(config.daemon);

    let socket_path = options
        .socket_path
        .or_else(|| settings.socket_path.clone())
        .or_else(crate::config::default_socket_path)
        .ok_or_else(|| DaemonError::SocketBindFailed {
            path: PathBuf::from("<unresolved>"),
            reason: "no socket path configured, and no platform default is available".to_string(),
        })?;

    let pid_path = crate::config::default_pid_path().ok_or_else(|| DaemonError::SocketBindFailed {
        path: PathBuf::from("<unresolved>"),
        reason: "no platform default pid file location is available".to_string(),
    })?;
    let _pid_file = PidFile::acquire(pid_path)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel::<SupervisorEvent>();
    let supervisors = build_supervisors(config.servers, &settings, &events_tx);
    let router = Arc::new(Router::new(supervisors));

    let events_task = tokio::spawn(drive_events(events_rx, Arc::clone(&router)));

    info!("starting autostart servers");
    router.start_autostart_servers().await;

    let listener = control::bind(&socket_path).await?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let serve_task = tokio::spawn(control::serve(
        listener,
        socket_path.clone(),
        Arc::clone(&router),
        shutdown_tx.clone(),
        settings.default_call_timeout(),
    ));

    info!(socket = %socket_path.display(), "daemon ready");

    tokio::select! {
        () = wait_for_shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        result = shutdown_rx.changed() => {
            if result.is_ok() {
                info!("shutdown requested over control socket");
            }
        }
    }

    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), serve_task).await {
        warn!(error = %e, "control server did not stop within the shutdown grace period");
    }

    router.stop_all().await;
    events_task.abort();

    info!("daemon stopped");
    Ok(())
}

fn build_supervisors(
    specs: Vec<crate::config::ServerSpec>,
    settings: &Arc<DaemonSettings>,
    events_tx: &mpsc::UnboundedSender<SupervisorEvent>,
) -> HashMap<String, Arc<Supervisor>> {
    specs
        .into_iter()
        .map(|spec| {
            let server_id = spec.server_id.clone();
            let supervisor = Supervisor::new(server_id.clone(), spec, Arc::clone(settings), events_tx.clone());
            (server_id, Arc::new(supervisor))
        })
        .collect()
}

/// Reacts to lifecycle events raised by supervisors: a `tools_changed`
/// notification triggers a fresh `tools/list` so the registry reflects
/// what the child now offers.
async fn drive_events(mut events_rx: mpsc::UnboundedReceiver<SupervisorEvent>, router: Arc<Router>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            SupervisorEvent::ToolsChanged { server_id } => {
                if let Err(e) = router.refresh_tools(&server_id).await {
                    warn!(server_id, error = %e, "failed to refresh tools after tools_changed");
                }
            }
            SupervisorEvent::Exited { server_id, code } => {
                warn!(server_id, code = ?code, "server exited");
            }
            SupervisorEvent::StateChanged { server_id, state } => {
                info!(server_id, state = state.as_str(), "server state changed");
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
