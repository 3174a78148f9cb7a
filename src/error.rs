//! Error types for the daemon.
//!
//! Each subsystem gets its own error enum; [`DaemonError`] is the top-level
//! type that [`crate::daemon`] and [`crate::control`] convert everything
//! into when a failure needs to cross a task boundary or reach the wire.
//!
//! # Wire mapping
//!
//! Every error type here can be mapped to a stable [`ErrorKind`] tag via
//! its `kind()` method, independent of the human-readable message. Control
//! socket clients match on this tag (`ControlResponse::error_kind`) rather
//! than parsing prose.

use std::path::PathBuf;

use thiserror::Error;

/// Stable machine-readable tag for an error, independent of its message.
///
/// This is the taxonomy from the design document, not a set of distinct
/// Rust types — several error variants below may share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandshakeFailed,
    StartFailed,
    ServerExited,
    NotReady,
    UnknownTool,
    UnknownServer,
    SchemaInvalid,
    Timeout,
    Cancelled,
    ConnectionClosed,
    ToolError,
    ProtocolError,
    ConfigError,
    Internal,
}

impl ErrorKind {
    /// The wire-stable name used in `ControlResponse::error_kind`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeFailed => "handshake_failed",
            Self::StartFailed => "start_failed",
            Self::ServerExited => "server_exited",
            Self::NotReady => "not_ready",
            Self::UnknownTool => "unknown_tool",
            Self::UnknownServer => "unknown_server",
            Self::SchemaInvalid => "schema_invalid",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ConnectionClosed => "connection_closed",
            Self::ToolError => "tool_error",
            Self::ProtocolError => "protocol_error",
            Self::ConfigError => "config_error",
            Self::Internal => "internal",
        }
    }
}

/// Errors from the MCP stdio connection (framing, correlation, handshake).
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The child's `initialize` response was malformed, mismatched protocol
    /// version, or never arrived before the handshake deadline.
    #[error("handshake with MCP server failed: {reason}")]
    HandshakeFailed {
        /// Human-readable description.
        reason: String,
    },

    /// A pending request exceeded its deadline without a terminal response.
    #[error("request timed out waiting for a response")]
    Timeout,

    /// The request was cancelled before the child responded.
    #[error("request was cancelled")]
    Cancelled,

    /// The connection was closed (locally or because the child exited)
    /// while the request was still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The child returned a JSON-RPC error for `tools/call`.
    #[error("tool returned an error: {message}")]
    ToolError {
        /// Message from the child's JSON-RPC error object.
        message: String,
        /// Optional JSON-RPC error code from the child.
        code: Option<i64>,
    },

    /// A line from the child could not be parsed as JSON-RPC.
    #[error("malformed JSON-RPC message from child: {reason}")]
    ProtocolError {
        /// Description of what was wrong with the message.
        reason: String,
    },

    /// Writing to or reading from the child's pipes failed.
    #[error("I/O error communicating with child: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Maps this error onto the stable wire taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::ToolError { .. } => ErrorKind::ToolError,
            Self::ProtocolError { .. } => ErrorKind::ProtocolError,
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from supervising a single child process.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The process could not be spawned or the handshake never completed.
    #[error("failed to start server '{server_id}': {reason}")]
    StartFailed {
        /// The server that failed to start.
        server_id: String,
        /// Human-readable description.
        reason: String,
    },

    /// The child process exited while calls were pending against it.
    #[error("server '{server_id}' exited unexpectedly (code {code:?})")]
    ServerExited {
        /// The server that exited.
        server_id: String,
        /// Exit code, if known.
        code: Option<i32>,
    },

    /// A call was made while the supervisor was not in a callable state.
    #[error("server '{server_id}' is not ready")]
    NotReady {
        /// The server that was not ready.
        server_id: String,
    },

    /// Propagated from the underlying connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl SupervisorError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StartFailed { .. } => ErrorKind::StartFailed,
            Self::ServerExited { .. } => ErrorKind::ServerExited,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::Connection(e) => e.kind(),
        }
    }
}

/// Errors from resolving and routing a tool call.
#[derive(Error, Debug)]
pub enum RouterError {
    /// No server offers a tool by this name (qualified or canonical).
    #[error("unknown tool: {tool_name}")]
    UnknownTool {
        /// The tool name that could not be resolved.
        tool_name: String,
    },

    /// A `server_id` was given that does not match any configured server.
    #[error("unknown server: {server_id}")]
    UnknownServer {
        /// The server id that was not found.
        server_id: String,
    },

    /// The supervisor could not be brought to a callable state, or the
    /// call itself failed once dispatched.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl RouterError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool { .. } => ErrorKind::UnknownTool,
            Self::UnknownServer { .. } => ErrorKind::UnknownServer,
            Self::Supervisor(e) => e.kind(),
        }
    }
}

/// Errors from loading and validating the on-disk configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed as TOML.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying TOML error.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// The parsed configuration failed validation.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Top-level daemon error, used at process boundaries (startup, control
/// responses, logs).
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Failed to bind or lock the control socket.
    #[error("failed to bind control socket at {path}: {reason}")]
    SocketBindFailed {
        /// Path of the socket that could not be bound.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// Another daemon instance already holds the PID file / socket.
    #[error("another instance is already running (pid file: {pid_file})")]
    AlreadyRunning {
        /// Path to the PID file that indicated a live instance.
        pid_file: PathBuf,
    },

    /// A daemon-internal invariant was violated. Always logged at error level.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ConfigError,
            Self::Router(e) => e.kind(),
            Self::Supervisor(e) => e.kind(),
            Self::Connection(e) => e.kind(),
            Self::SocketBindFailed { .. } | Self::AlreadyRunning { .. } | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_as_str_is_snake_case() {
        assert_eq!(ErrorKind::UnknownTool.as_str(), "unknown_tool");
        assert_eq!(ErrorKind::ServerExited.as_str(), "server_exited");
    }

    #[test]
    fn router_error_propagates_supervisor_kind() {
        let err = RouterError::Supervisor(SupervisorError::NotReady {
            server_id: "a".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[test]
    fn connection_timeout_kind() {
        assert_eq!(ConnectionError::Timeout.kind(), ErrorKind::Timeout);
    }
}
