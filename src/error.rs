use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::RemoteError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to launch plugin {path}: {reason}")]
    LaunchFailed { path: PathBuf, reason: String },

    #[error("Handshake with plugin {path} failed: {reason}")]
    HandshakeFailed { path: PathBuf, reason: String },

    #[error("Plugin {path} did not dispense service '{service}': {reason}")]
    DispenseFailed {
        path: PathBuf,
        service: String,
        reason: String,
    },

    #[error("Function '{function}' not found in plugin")]
    FunctionNotFound { function: String },

    #[error("Codec error in call to '{function}': {source}")]
    Codec {
        function: String,
        #[source]
        source: CodecError,
    },

    #[error("Call to '{function}' failed: {source}")]
    CallFailed {
        function: String,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Plugin shutdown failed: {0}")]
    ShutdownFailed(String),
}

impl BridgeError {
    /// Whether repeating the same operation could reasonably succeed.
    /// The bridge never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::CallFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_function_not_found(&self) -> bool {
        matches!(self, BridgeError::FunctionNotFound { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Remote error: {0}")]
    Remote(RemoteError),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::ConnectionFailed(_)
        )
    }

    /// The connection can no longer carry requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::SendFailed(_)
                | TransportError::ReceiveFailed(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
