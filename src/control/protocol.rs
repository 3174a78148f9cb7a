//! Wire format for the control-plane socket: one line-delimited JSON
//! envelope per request, zero or more `progress` envelopes, then exactly
//! one terminal `success` or `error` envelope per request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DaemonError, ErrorKind};

/// A client-to-daemon request. `request_id` is chosen by the client and
/// echoed back on every response envelope so a client multiplexing several
/// requests over one connection can tell them apart.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ControlRequest {
    ToolCall {
        request_id: String,
        #[serde(default)]
        server_id: Option<String>,
        tool_name: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        timeout: Option<u64>,
    },
    ListTools {
        request_id: String,
        #[serde(default)]
        server_id: Option<String>,
    },
    ServerStatus {
        request_id: String,
        server_id: String,
    },
    DaemonStatus {
        request_id: String,
    },
    StartServer {
        request_id: String,
        server_id: String,
    },
    StopServer {
        request_id: String,
        server_id: String,
    },
    CancelCall {
        request_id: String,
        target_request_id: String,
    },
    Shutdown {
        request_id: String,
    },
}

impl ControlRequest {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::ToolCall { request_id, .. }
            | Self::ListTools { request_id, .. }
            | Self::ServerStatus { request_id, .. }
            | Self::DaemonStatus { request_id }
            | Self::StartServer { request_id, .. }
            | Self::StopServer { request_id, .. }
            | Self::CancelCall { request_id, .. }
            | Self::Shutdown { request_id } => request_id,
        }
    }
}

/// The payload of a `progress` response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

/// A daemon-to-client response envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Success {
        request_id: String,
        data: Value,
    },
    Error {
        request_id: String,
        error: String,
        error_kind: &'static str,
    },
    Progress {
        request_id: String,
        progress: ProgressPayload,
    },
}

impl ControlResponse {
    #[must_use]
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self::Success {
            request_id: request_id.into(),
            data,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, err: &DaemonError) -> Self {
        Self::Error {
            request_id: request_id.into(),
            error: err.to_string(),
            error_kind: err.kind().as_str(),
        }
    }

    #[must_use]
    pub fn error_with_kind(request_id: impl Into<String>, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self::Error {
            request_id: request_id.into(),
            error: message.into(),
            error_kind: kind.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_request_round_trips() {
        let raw = r#"{"type":"tool_call","request_id":"1","tool_name":"search","args":{"q":"x"}}"#;
        let req: ControlRequest = serde_json::from_str(raw).unwrap();
        match req {
            ControlRequest::ToolCall { request_id, tool_name, server_id, .. } => {
                assert_eq!(request_id, "1");
                assert_eq!(tool_name, "search");
                assert_eq!(server_id, None);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn tool_call_request_accepts_explicit_server_id() {
        let raw = r#"{"type":"tool_call","request_id":"1","server_id":"git","tool_name":"commit","args":{}}"#;
        let req: ControlRequest = serde_json::from_str(raw).unwrap();
        match req {
            ControlRequest::ToolCall { server_id, .. } => assert_eq!(server_id.as_deref(), Some("git")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn tool_call_request_rejects_unknown_fields() {
        let raw = r#"{"type":"tool_call","request_id":"1","tool_name":"search","arguments":{}}"#;
        let result: Result<ControlRequest, _> = serde_json::from_str(raw);
        assert!(result.is_err(), "the old 'arguments' field name should no longer deserialise");
    }

    #[test]
    fn shutdown_request_id_accessor() {
        let req = ControlRequest::Shutdown {
            request_id: "abc".to_string(),
        };
        assert_eq!(req.request_id(), "abc");
    }

    #[test]
    fn error_response_serialises_snake_case_kind() {
        let response = ControlResponse::error_with_kind("1", "nope", ErrorKind::UnknownTool);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error_kind"], "unknown_tool");
        assert_eq!(value["status"], "error");
    }

    #[test]
    fn progress_response_nests_step_and_total() {
        let response = ControlResponse::Progress {
            request_id: "1".to_string(),
            progress: ProgressPayload {
                message: Some("halfway".to_string()),
                step: Some(5),
                total: Some(10),
            },
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "progress");
        assert_eq!(value["progress"]["step"], 5);
        assert_eq!(value["progress"]["total"], 10);
        assert_eq!(value["progress"]["message"], "halfway");
    }

    #[test]
    fn success_response_uses_data_field() {
        let response = ControlResponse::success("1", serde_json::json!({"ok": true}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["ok"], true);
    }
}
