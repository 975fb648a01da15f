//! Wire messages shared by the plugin host and the plugin server
//!
//! The simple (`rpc`) transport speaks newline-delimited JSON-RPC 2.0.
//! The multiplexed (`mux`) transport sends [`MuxFrame`]s inside
//! length-delimited frames so several calls can share one connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod handshake;

pub use handshake::{HandshakeError, HandshakeLine};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names understood by the plugin server
pub mod method {
    pub const DISPENSE: &str = "Plugin.Dispense";
    pub const LIST_FUNCTION_NAMES: &str = "Plugin.ListFunctionNames";
    pub const INVOKE: &str = "Plugin.Invoke";
}

/// Structured error names carried across the process boundary
pub mod error_kind {
    pub const FUNCTION_NOT_FOUND: &str = "FunctionNotFound";
    pub const MALFORMED_PAYLOAD: &str = "MalformedPayload";
    pub const CALL_FAILED: &str = "CallFailed";
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
}

/// Error reported by the plugin side: a name plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_function_not_found(&self) -> bool {
        self.kind == error_kind::FUNCTION_NOT_FOUND
    }

    pub fn is_service_not_found(&self) -> bool {
        self.kind == error_kind::SERVICE_NOT_FOUND
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseParams {
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeParams {
    pub name: String,
    /// Codec text of the argument sequence
    pub args: String,
}

// Simple transport envelopes

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: i64, error: RemoteError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError::from(error)),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.into()),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const SERVER_ERROR: i64 = -32000;
}

impl From<RemoteError> for JsonRpcError {
    fn from(error: RemoteError) -> Self {
        let code = match error.kind.as_str() {
            error_kind::METHOD_NOT_FOUND => Self::METHOD_NOT_FOUND,
            error_kind::MALFORMED_PAYLOAD => Self::INVALID_PARAMS,
            _ => Self::SERVER_ERROR,
        };
        Self {
            code,
            message: error.message,
            data: Some(serde_json::json!({ "kind": error.kind })),
        }
    }
}

impl From<JsonRpcError> for RemoteError {
    fn from(error: JsonRpcError) -> Self {
        let kind = error
            .data
            .as_ref()
            .and_then(|data| data.get("kind"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| match error.code {
                JsonRpcError::METHOD_NOT_FOUND => error_kind::METHOD_NOT_FOUND.to_string(),
                _ => error_kind::CALL_FAILED.to_string(),
            });
        RemoteError {
            kind,
            message: error.message,
        }
    }
}

// Multiplexed transport frames

/// One frame on a multiplexed connection. `stream` ties responses to the
/// request that opened the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxFrame {
    pub stream: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    Request {
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Partial result of a streamed response
    Item { payload: Value },
    /// Closes a streamed response
    End,
    Response { payload: Value },
    Error { error: RemoteError },
}

impl FrameBody {
    /// Whether this body finishes its stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FrameBody::End | FrameBody::Response { .. } | FrameBody::Error { .. }
        )
    }
}
