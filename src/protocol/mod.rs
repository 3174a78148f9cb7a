//! JSON-RPC 2.0 wire types for the MCP child protocol.
//!
//! This module implements the message shapes the daemon exchanges with
//! each MCP server child over stdio. It does not implement any transport
//! or correlation logic itself — see [`crate::protocol::transport`] for
//! line framing and [`crate::connection`] for request/response correlation.
//!
//! # Protocol version
//!
//! This implementation targets MCP protocol version `2024-11-05`. A child
//! that negotiates a different version during `initialize` fails the
//! handshake (see [`crate::connection::Connection::initialize`]).

pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dated MCP protocol version string this daemon speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Name advertised to children during `initialize`.
pub const CLIENT_NAME: &str = "mcpd";

/// A JSON-RPC request id. The daemon always allocates numeric ids for
/// outgoing requests; this type also accepts string/null ids on incoming
/// messages so replies from unusual children still parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outgoing JSON-RPC notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// The `error` object inside a JSON-RPC error response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A message received from a child, before it is known whether it is a
/// response or a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// The meaningful shapes an [`IncomingMessage`] can resolve to.
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    /// A terminal reply to a request we issued, identified by `id`.
    Response {
        id: RequestId,
        outcome: Result<Value, JsonRpcErrorObject>,
    },
    /// A notification pushed by the child (no id).
    Notification { method: String, params: Option<Value> },
    /// A message with an id we never issued, or we already resolved.
    UnmatchedId { id: RequestId },
}

/// Classifies a raw incoming message into a [`ParsedMessage`].
///
/// This function does not look the id up in any pending table — callers
/// are responsible for that. `UnmatchedId` is only ever produced for
/// well-formed messages that merely fail to look like either shape; the
/// pending-table lookup happens one layer up in [`crate::connection`].
#[must_use]
pub fn classify(msg: IncomingMessage) -> ParsedMessage {
    match (msg.id, msg.method) {
        (Some(id), None) => {
            let outcome = match msg.error {
                Some(err) => Err(err),
                None => Ok(msg.result.unwrap_or(Value::Null)),
            };
            ParsedMessage::Response { id, outcome }
        }
        (None, Some(method)) => ParsedMessage::Notification {
            method,
            params: msg.params,
        },
        (Some(id), Some(_)) => ParsedMessage::UnmatchedId { id },
        (None, None) => ParsedMessage::UnmatchedId {
            id: RequestId::String(String::new()),
        },
    }
}

/// Progress notification payload (`notifications/progress`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result page of `tools/list`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_response_with_result() {
        let msg: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        match classify(msg) {
            ParsedMessage::Response { id, outcome } => {
                assert_eq!(id, RequestId::Number(1));
                assert!(outcome.is_ok());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classify_response_with_error() {
        let msg: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"not found"}}"#,
        )
        .unwrap();
        match classify(msg) {
            ParsedMessage::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -32601);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let msg: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":1,"progress":0.5}}"#,
        )
        .unwrap();
        match classify(msg) {
            ParsedMessage::Notification { method, .. } => {
                assert_eq!(method, "notifications/progress");
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn request_serialises_without_trailing_null_params() {
        let req = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("params").is_none());
    }
}
