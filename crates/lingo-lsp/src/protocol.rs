//! JSON-RPC envelope types.
//!
//! The Language Server Protocol carries JSON-RPC 2.0 bodies inside
//! `Content-Length`-framed messages. This module defines the three envelope
//! shapes (request, response, notification) and the decode step that
//! classifies an inbound body before it is dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC notification (no id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// An inbound JSON-RPC body before classification.
///
/// Language servers send responses (numeric id, result or error), server
/// notifications (method, no id) and occasionally server-to-client requests
/// (method and id). Fields are all optional so one decode handles every
/// shape; [`RawMessage::classify`] sorts out which one arrived.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A classified inbound message.
#[derive(Debug, Clone)]
pub enum Message {
    /// A response correlated to a request this client issued.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<JsonRpcError>,
    },
    /// A server-initiated notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A server-to-client request. This client does not answer these; they
    /// are surfaced so the transport can log and drop them.
    ServerRequest { id: Value, method: String },
}

impl RawMessage {
    /// Classify an inbound body into one of the three envelope shapes.
    ///
    /// Returns `None` for bodies that fit none of them (no method and no
    /// usable id), which the read loop drops without terminating.
    pub fn classify(self) -> Option<Message> {
        match (self.id, self.method) {
            (Some(id), None) => {
                // Only numeric ids are ever allocated by this client.
                let id = id.as_u64()?;
                Some(Message::Response {
                    id,
                    result: self.result,
                    error: self.error,
                })
            }
            (None, Some(method)) => Some(Message::Notification {
                method,
                params: self.params,
            }),
            (Some(id), Some(method)) => Some(Message::ServerRequest { id, method }),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(7, "textDocument/hover", Some(json!({"a": 1})));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "textDocument/hover");
        assert_eq!(value["params"]["a"], 1);
    }

    #[test]
    fn test_notification_omits_missing_params() {
        let notification = JsonRpcNotification::new("initialized", None);
        let text = serde_json::to_string(&notification).unwrap();
        assert!(!text.contains("params"));
        assert!(!text.contains("id"));
    }

    #[test]
    fn test_classify_response() {
        let raw: RawMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}}))
                .unwrap();
        match raw.classify() {
            Some(Message::Response { id, result, error }) => {
                assert_eq!(id, 3);
                assert!(result.is_some());
                assert!(error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let raw: RawMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap();
        match raw.classify() {
            Some(Message::Response { id, error, .. }) => {
                assert_eq!(id, 4);
                let error = error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "method not found");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let raw: RawMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {"uri": "file:///a.rs", "diagnostics": []}
        }))
        .unwrap();
        match raw.classify() {
            Some(Message::Notification { method, params }) => {
                assert_eq!(method, "textDocument/publishDiagnostics");
                assert!(params.is_some());
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_request() {
        let raw: RawMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "cfg-1",
            "method": "workspace/configuration",
            "params": {}
        }))
        .unwrap();
        assert!(matches!(
            raw.classify(),
            Some(Message::ServerRequest { .. })
        ));
    }

    #[test]
    fn test_classify_garbage() {
        let raw: RawMessage = serde_json::from_value(json!({"jsonrpc": "2.0"})).unwrap();
        assert!(raw.classify().is_none());

        // A non-numeric id with no method matches nothing this client sent.
        let raw: RawMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "abc", "result": null}))
                .unwrap();
        assert!(raw.classify().is_none());
    }
}
