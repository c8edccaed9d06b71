//! JSON-RPC 2.0 wire types for the agent protocol.
//!
//! One JSON object per LF-terminated UTF-8 line. Inbound traffic is routed
//! by shape: id + method is a request, bare id is a response, bare method
//! is a notification.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Fixed protocol version announced at handshake.
pub const PROTOCOL_VERSION: &str = "2025-01-01";

/// JSON-RPC invalid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Method names this adapter speaks.
pub mod method {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Prompt dispatch request.
    pub const PROMPTS_REQUEST: &str = "prompts/request";
    /// Tool invocation, in either direction.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Log/message notification.
    pub const MESSAGE: &str = "notifications/message";
    /// Liveness probe.
    pub const PING: &str = "ping";
}

/// Client identity sent at handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "MemNexus".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Capability set declared at handshake: tools, resources, prompts, logging.
pub fn capabilities() -> Value {
    json!({
        "tools": {"listChanged": true},
        "resources": {"subscribe": true, "listChanged": true},
        "prompts": {"listChanged": true},
        "logging": {},
    })
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code per JSON-RPC 2.0.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// An inbound message classified by shape.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Peer-initiated request expecting a response.
    Request {
        /// Request id, echoed in the response.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
    /// Response to one of our requests.
    Response {
        /// Id of the request being answered.
        id: Value,
        /// Success payload, if any.
        result: Option<Value>,
        /// Error payload, if any.
        error: Option<RpcError>,
    },
    /// Fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
}

/// Classify a parsed JSON value into an [`Incoming`] message.
///
/// Returns `None` for JSON that is not a recognizable JSON-RPC shape; the
/// connection stays open in that case.
pub fn classify(value: Value) -> Option<Incoming> {
    let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let method = value.get("method").and_then(Value::as_str).map(str::to_string);

    match (has_id, method) {
        (true, Some(method)) => Some(Incoming::Request {
            id: value.get("id").cloned().unwrap_or(Value::Null),
            method,
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }),
        (true, None) => {
            let error = value
                .get("error")
                .cloned()
                .and_then(|e| serde_json::from_value(e).ok());
            Some(Incoming::Response {
                id: value.get("id").cloned().unwrap_or(Value::Null),
                result: value.get("result").cloned(),
                error,
            })
        }
        (false, Some(method)) => Some(Incoming::Notification {
            method,
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }),
        (false, None) => None,
    }
}

/// Canonical string form of a message id, usable as a map key.
///
/// String ids are used verbatim; numeric ids use their decimal form, so a
/// peer echoing `1` for our `1` always matches.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build a request envelope.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Build a success response envelope.
pub fn response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Build an error response envelope.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// Build a notification envelope.
pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// One event yielded by a prompt stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptEvent {
    /// A message from the peer (including wrapped non-JSON output).
    Message {
        /// Notification params.
        data: Value,
    },
    /// The peer announced a tool call.
    ToolCall {
        /// Call params.
        data: Value,
    },
    /// A result payload, including the final prompt result.
    ToolResult {
        /// Result value.
        data: Value,
    },
    /// Stream-terminating failure (peer error, timeout, closed stream).
    Error {
        /// What went wrong.
        message: String,
    },
}

impl PromptEvent {
    /// Map a raw peer message into a prompt event, mirroring the routing the
    /// peer side uses: errors, `notifications/message`, `tools/call`
    /// announcements, and bare results.
    pub fn from_peer_message(value: &Value) -> Option<PromptEvent> {
        if let Some(error) = value.get("error") {
            return Some(PromptEvent::Error {
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("peer error")
                    .to_string(),
            });
        }
        match value.get("method").and_then(Value::as_str) {
            Some(method::MESSAGE) => Some(PromptEvent::Message {
                data: value.get("params").cloned().unwrap_or(Value::Null),
            }),
            Some(method::TOOLS_CALL) => Some(PromptEvent::ToolCall {
                data: value.get("params").cloned().unwrap_or(Value::Null),
            }),
            _ => value
                .get("result")
                .map(|result| PromptEvent::ToolResult { data: result.clone() }),
        }
    }
}
