// review-bridge/src/protocol.rs

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// Error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const INVALID_SESSION: i64 = -32001;

// Method names
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

// Event names
pub const EVENT_DIFF_OUTCOME: &str = "ide/diffOutcome";
pub const EVENT_OPEN_FILES_CHANGED: &str = "ide/openFilesChanged";
pub const EVENT_KEEP_ALIVE: &str = "ide/keepAlive";

/// JSON-RPC error object.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self { Self { code, message: message.into(), data: None } }
    pub fn parse(message: impl Into<String>) -> Self { Self::new(PARSE_ERROR, message) }
    pub fn invalid_request(message: impl Into<String>) -> Self { Self::new(INVALID_REQUEST, message) }
    pub fn method_not_found(method: &str) -> Self { Self::new(METHOD_NOT_FOUND, format!("method not found: {method}")) }
    pub fn invalid_params(message: impl Into<String>) -> Self { Self::new(INVALID_PARAMS, message) }
    pub fn internal(message: impl Into<String>) -> Self { Self::new(INTERNAL_ERROR, message) }
    pub fn invalid_session() -> Self { Self::new(INVALID_SESSION, "invalid or missing session id") }
}

/// One inbound message, classified by shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Request { id: Value, method: String, params: Value },
    Notification { method: String, params: Value },
    /// A client's answer to a server request. This server never asks, so
    /// these are acknowledged and dropped.
    Response { id: Value },
}

#[derive(Deserialize)]
struct Envelope {
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: Option<Value>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<Value>,
}

impl Incoming {
    /// Classifies a raw body. The error carries the request id when one could
    /// be recovered, so the caller can address the error response.
    pub fn parse(body: &[u8]) -> Result<Self, (Value, RpcError)> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| (Value::Null, RpcError::parse(e.to_string())))?;
        if !raw.is_object() {
            return Err((Value::Null, RpcError::invalid_request("expected a single JSON-RPC object")));
        }
        let env: Envelope =
            serde_json::from_value(raw).map_err(|e| (Value::Null, RpcError::invalid_request(e.to_string())))?;
        let id = env.id.clone().unwrap_or(Value::Null);
        if env.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err((id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
        }
        if !matches!(id, Value::Null | Value::String(_) | Value::Number(_)) {
            return Err((Value::Null, RpcError::invalid_request("id must be a string or number")));
        }
        if !matches!(env.params, Value::Null | Value::Object(_) | Value::Array(_)) {
            return Err((id, RpcError::invalid_request("params must be structured")));
        }
        match (env.method, env.id) {
            (Some(Value::String(method)), Some(id)) => Ok(Self::Request { id, method, params: env.params }),
            (Some(Value::String(method)), None) => Ok(Self::Notification { method, params: env.params }),
            (Some(_), _) => Err((id, RpcError::invalid_request("method must be a string"))),
            (None, Some(id)) if env.result.is_some() || env.error.is_some() => Ok(Self::Response { id }),
            (None, _) => Err((id, RpcError::invalid_request("missing method"))),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

pub fn success(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub fn failure(id: &Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error })
}

/// Server→client push (no id).
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &'static str, params: Value) -> Self { Self { method, params } }

    pub fn keep_alive() -> Self { Self::new(EVENT_KEEP_ALIVE, json!({})) }

    pub fn to_value(&self) -> Value {
        json!({ "jsonrpc": JSONRPC_VERSION, "method": self.method, "params": self.params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_requests_notifications_and_responses() {
        let req = Incoming::parse(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req, Incoming::Request { id: json!(1), method: "ping".into(), params: Value::Null });

        let note = Incoming::parse(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert_eq!(note.method(), Some(METHOD_INITIALIZED));

        let resp = Incoming::parse(br#"{"jsonrpc":"2.0","id":"x","result":{}}"#).unwrap();
        assert_eq!(resp, Incoming::Response { id: json!("x") });
    }

    #[test]
    fn malformed_bodies_map_to_protocol_codes() {
        let (_, e) = Incoming::parse(b"{not json").unwrap_err();
        assert_eq!(e.code, PARSE_ERROR);

        let (_, e) = Incoming::parse(br#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#).unwrap_err();
        assert_eq!(e.code, INVALID_REQUEST);

        let (id, e) = Incoming::parse(br#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#).unwrap_err();
        assert_eq!((id, e.code), (json!(9), INVALID_REQUEST));

        let (_, e) = Incoming::parse(br#"{"jsonrpc":"2.0","id":2,"method":7}"#).unwrap_err();
        assert_eq!(e.code, INVALID_REQUEST);

        let (_, e) = Incoming::parse(br#"{"jsonrpc":"2.0","id":3,"method":"x","params":5}"#).unwrap_err();
        assert_eq!(e.code, INVALID_REQUEST);
    }

    #[test]
    fn error_response_shape() {
        let v = failure(&json!(4), &RpcError::invalid_session());
        assert_eq!(v["error"]["code"], json!(INVALID_SESSION));
        assert!(v["error"].get("data").is_none());
        assert_eq!(Notification::keep_alive().to_value()["method"], json!(EVENT_KEEP_ALIVE));
    }
}
