//! Resolves a client's tool call to a server and drives it through that
//! server's supervisor.
//!
//! The router owns the [`crate::registry::Registry`] and a map of
//! `server_id -> Supervisor`. It never talks to a child's stdio directly —
//! all of that is the supervisor's and connection's job — but it is the
//! one place that decides *which* server a name refers to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, instrument, warn};

use crate::connection::ProgressEvent;
use crate::error::RouterError;
use crate::protocol::RequestId;
use crate::registry::{Collision, RegisteredTool, Registry};
use crate::supervisor::Supervisor;

/// A resolved, in-flight tool call. Routing creates one of these, drives
/// it to completion, and discards it; nothing persists it beyond that.
pub struct Operation {
    pub server_id: String,
    pub tool_name: String,
}

/// Aggregates every configured server's supervisor and tool catalog.
pub struct Router {
    supervisors: HashMap<String, Arc<Supervisor>>,
    registry: RwLock<Registry>,
}

impl Router {
    #[must_use]
    pub fn new(supervisors: HashMap<String, Arc<Supervisor>>) -> Self {
        Self {
            supervisors,
            registry: RwLock::new(Registry::new()),
        }
    }

    #[must_use]
    pub fn server_ids(&self) -> Vec<String> {
        self.supervisors.keys().cloned().collect()
    }

    #[must_use]
    pub fn supervisor(&self, server_id: &str) -> Option<Arc<Supervisor>> {
        self.supervisors.get(server_id).cloned()
    }

    /// Refreshes the catalog entries for one server after a successful
    /// `tools/list`, e.g. right after startup or after a `tools_changed`
    /// notification.
    pub async fn refresh_tools(&self, server_id: &str) -> Result<(), RouterError> {
        let Some(supervisor) = self.supervisors.get(server_id) else {
            return Err(RouterError::UnknownServer {
                server_id: server_id.to_string(),
            });
        };
        let tools = supervisor.list_tools().await?;
        let priority = supervisor.priority();
        let delta = self
            .registry
            .write()
            .await
            .replace_server_tools(server_id, priority, tools);
        if !delta.added.is_empty() || !delta.removed.is_empty() {
            info!(server_id, added = ?delta.added, removed = ?delta.removed, "tool catalog updated");
        }
        Ok(())
    }

    /// Drops a server's catalog entries, e.g. after it stops.
    pub async fn drop_tools(&self, server_id: &str) {
        self.registry.write().await.remove_server(server_id);
    }

    #[must_use]
    pub async fn list_tools(&self) -> Vec<RegisteredTool> {
        self.registry.read().await.all_tools().cloned().collect()
    }

    #[must_use]
    pub async fn collisions(&self) -> Vec<Collision> {
        self.registry.read().await.collisions()
    }

    /// Resolves a tool name to `(server_id, tool_name)`.
    ///
    /// `tool_name` may be unqualified (resolved via collision priority) or
    /// qualified as `server_id/tool_name` (bypassing collision resolution
    /// entirely, reaching a non-canonical provider if needed).
    async fn resolve(&self, tool_name: &str) -> Result<(String, String), RouterError> {
        if let Some((server_id, name)) = tool_name.split_once('/') {
            if self.supervisors.contains_key(server_id) {
                let registry = self.registry.read().await;
                return registry
                    .resolve_qualified(server_id, name)
                    .map(|t| (t.server_id.clone(), t.name.clone()))
                    .ok_or_else(|| RouterError::UnknownTool {
                        tool_name: tool_name.to_string(),
                    });
            }
        }

        let registry = self.registry.read().await;
        registry
            .resolve_unqualified(tool_name)
            .map(|t| (t.server_id.clone(), t.name.clone()))
            .ok_or_else(|| RouterError::UnknownTool {
                tool_name: tool_name.to_string(),
            })
    }

    /// Resolves a tool name against a specific, already-known server,
    /// bypassing both collision resolution and the unqualified-name
    /// string-splitting `resolve` uses. Used by the control plane, which
    /// carries `server_id` as its own wire field rather than smuggling it
    /// into the tool name.
    async fn resolve_qualified(&self, server_id: &str, tool_name: &str) -> Result<(String, String), RouterError> {
        if !self.supervisors.contains_key(server_id) {
            return Err(RouterError::UnknownServer {
                server_id: server_id.to_string(),
            });
        }
        let registry = self.registry.read().await;
        registry
            .resolve_qualified(server_id, tool_name)
            .map(|t| (t.server_id.clone(), t.name.clone()))
            .ok_or_else(|| RouterError::UnknownTool {
                tool_name: format!("{server_id}/{tool_name}"),
            })
    }

    /// Resolves, ensures the target server is ready, and calls the tool.
    ///
    /// `deadline` and `reset_deadline_on_progress` come from the control
    /// request; when the client gave no override, the control server
    /// passes the daemon's default deadline and `reset_deadline_on_progress
    /// = true` so long-running, actively-progressing tools are not killed
    /// by an arbitrary fixed ceiling.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
    ) -> Result<Value, RouterError> {
        self.call_tool_inner(None, tool_name, arguments, deadline, progress_sink, reset_deadline_on_progress, None)
            .await
    }

    /// Like [`Router::call_tool`], but resolves against an explicit
    /// `server_id` when given, and forwards the connection-level
    /// [`RequestId`] (paired with the resolved `server_id`) through
    /// `id_sink` as soon as it is allocated, so a caller can cancel the
    /// call before it completes.
    pub async fn call_tool_cancellable(
        &self,
        server_id: Option<&str>,
        tool_name: &str,
        arguments: Value,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
        id_sink: oneshot::Sender<(String, RequestId)>,
    ) -> Result<Value, RouterError> {
        self.call_tool_inner(
            server_id,
            tool_name,
            arguments,
            deadline,
            progress_sink,
            reset_deadline_on_progress,
            Some(id_sink),
        )
        .await
    }

    #[instrument(skip(self, arguments, progress_sink, id_sink))]
    async fn call_tool_inner(
        &self,
        server_id: Option<&str>,
        tool_name: &str,
        arguments: Value,
        deadline: Duration,
        progress_sink: Option<mpsc::UnboundedSender<ProgressEvent>>,
        reset_deadline_on_progress: bool,
        id_sink: Option<oneshot::Sender<(String, RequestId)>>,
    ) -> Result<Value, RouterError> {
        let (server_id, name) = match server_id {
            Some(server_id) => self.resolve_qualified(server_id, tool_name).await?,
            None => self.resolve(tool_name).await?,
        };
        let Some(supervisor) = self.supervisors.get(&server_id) else {
            return Err(RouterError::UnknownServer { server_id });
        };

        supervisor.ensure_ready().await?;

        let connection_id_sink = id_sink.map(|id_sink| {
            let (inner_tx, inner_rx) = oneshot::channel();
            let resolved_server_id = server_id.clone();
            tokio::spawn(async move {
                if let Ok(id) = inner_rx.await {
                    let _ = id_sink.send((resolved_server_id, id));
                }
            });
            inner_tx
        });

        let result = supervisor
            .call_tool(
                &name,
                arguments,
                deadline,
                progress_sink,
                reset_deadline_on_progress,
                connection_id_sink,
            )
            .await;

        if let Err(e) = &result {
            warn!(server_id, tool = name, error = %e, "tool call failed");
        }

        Ok(result?)
    }

    /// Starts every server marked `autostart` and performs an initial
    /// catalog discovery for each one that comes up ready.
    pub async fn start_autostart_servers(&self) {
        for (server_id, supervisor) in &self.supervisors {
            if !supervisor.autostart() {
                continue;
            }
            match supervisor.ensure_ready().await {
                Ok(()) => {
                    if let Err(e) = self.refresh_tools(server_id).await {
                        warn!(server_id, error = %e, "initial tool discovery failed");
                    }
                }
                Err(e) => warn!(server_id, error = %e, "autostart failed"),
            }
        }
    }

    /// Stops every supervised server, gracefully where possible.
    pub async fn stop_all(&self) {
        for (server_id, supervisor) in &self.supervisors {
            supervisor.stop(true).await;
            self.drop_tools(server_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_carries_resolved_identity() {
        let op = Operation {
            server_id: "git".to_string(),
            tool_name: "commit".to_string(),
        };
        assert_eq!(op.server_id, "git");
        assert_eq!(op.tool_name, "commit");
    }
}
