//! Plugin-side half of the transport pair
//!
//! A plugin binary builds a [`FunctionRegistry`], then calls [`serve`].
//! `serve` checks that it was launched by a bridge host, binds a loopback
//! listener, announces it with the handshake line and answers
//! `ListFunctionNames` / `Invoke` requests over the transport style the
//! host asked for.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::protocol::handshake::{HandshakeLine, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, TRANSPORT_ENV};
use crate::protocol::{error_kind, DispenseParams, InvokeParams, RemoteError};
use crate::transport::TransportStyle;
use crate::value::{self, Value};

pub mod mux;
pub mod simple;

/// Failure reported by a registered function
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FunctionError(pub String);

impl From<String> for FunctionError {
    fn from(message: String) -> Self {
        FunctionError(message)
    }
}

impl From<&str> for FunctionError {
    fn from(message: &str) -> Self {
        FunctionError(message.to_string())
    }
}

pub type PluginFunction = Arc<dyn Fn(Vec<Value>) -> Result<Value, FunctionError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(
        "This binary is a plugin and is meant to be launched by a plugin bridge host, \
         not executed directly"
    )]
    MissingCookie,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named functions exposed by a plugin process
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, PluginFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.insert(name.clone(), Arc::new(function)).is_some() {
            tracing::warn!(function = %name, "Function registered twice, keeping the latest");
        }
        self
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Decode `args`, run the function on the blocking pool and encode its
    /// result.
    pub async fn invoke(&self, name: &str, args: &str) -> Result<String, RemoteError> {
        let function = self.functions.get(name).cloned().ok_or_else(|| {
            RemoteError::new(
                error_kind::FUNCTION_NOT_FOUND,
                format!("function '{name}' is not registered"),
            )
        })?;

        let args = value::decode_args(args.as_bytes())
            .map_err(|e| RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))?;

        let result = tokio::task::spawn_blocking(move || function(args))
            .await
            .map_err(|e| {
                let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                RemoteError::new(error_kind::CALL_FAILED, format!("function '{name}' {reason}"))
            })?
            .map_err(|e| RemoteError::new(error_kind::CALL_FAILED, e.0))?;

        let bytes = value::encode(&result)
            .map_err(|e| RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))
    }
}

/// Method handling shared by both server styles
pub(crate) struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    style: TransportStyle,
    dispensed: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<FunctionRegistry>, style: TransportStyle) -> Self {
        Self {
            registry,
            style,
            dispensed: AtomicBool::new(false),
        }
    }

    pub(crate) fn dispense(&self, params: JsonValue) -> Result<JsonValue, RemoteError> {
        let params: DispenseParams = serde_json::from_value(params)
            .map_err(|e| RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))?;

        if params.service != self.style.as_str() {
            return Err(RemoteError::new(
                error_kind::SERVICE_NOT_FOUND,
                format!(
                    "service '{}' is not offered, available: '{}'",
                    params.service, self.style
                ),
            ));
        }

        self.dispensed.store(true, Ordering::SeqCst);
        tracing::debug!(service = %params.service, "Service dispensed");
        Ok(JsonValue::Null)
    }

    pub(crate) fn list_function_names(&self) -> Result<Vec<String>, RemoteError> {
        self.ensure_dispensed()?;
        Ok(self.registry.names())
    }

    pub(crate) async fn invoke(&self, params: JsonValue) -> Result<JsonValue, RemoteError> {
        self.ensure_dispensed()?;
        let params: InvokeParams = serde_json::from_value(params)
            .map_err(|e| RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))?;

        tracing::debug!(function = %params.name, "Invoke start");
        let result = self.registry.invoke(&params.name, &params.args).await;
        match &result {
            Ok(_) => tracing::debug!(function = %params.name, "Invoke success"),
            Err(e) => tracing::error!(function = %params.name, error = %e, "Invoke failed"),
        }
        result.map(JsonValue::String)
    }

    fn ensure_dispensed(&self) -> Result<(), RemoteError> {
        if self.dispensed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::new(
                error_kind::SERVICE_NOT_FOUND,
                "no service has been dispensed on this connection",
            ))
        }
    }
}

/// Serves one host connection with a fixed transport style
pub struct Server {
    registry: Arc<FunctionRegistry>,
    style: TransportStyle,
}

impl Server {
    pub fn new(registry: FunctionRegistry, style: TransportStyle) -> Self {
        Self {
            registry: Arc::new(registry),
            style,
        }
    }

    pub fn style(&self) -> TransportStyle {
        self.style
    }

    /// Accept the host's connection and serve it until it closes.
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::info!(%peer, style = %self.style, "Host connected");

        let dispatcher = Arc::new(Dispatcher::new(self.registry, self.style));
        match self.style {
            TransportStyle::Simple => simple::serve_connection(stream, dispatcher).await,
            TransportStyle::Multiplexed => mux::serve_connection(stream, dispatcher).await,
        }?;

        tracing::info!("Host disconnected");
        Ok(())
    }
}

/// Run the plugin process: verify the launch environment, announce the
/// listener on stdout and serve the host until it disconnects.
pub async fn serve(registry: FunctionRegistry) -> Result<(), ServeError> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(ServeError::MissingCookie);
    }

    let style = TransportStyle::from_designator(std::env::var(TRANSPORT_ENV).ok().as_deref());
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let line = HandshakeLine::new(listener.local_addr()?, style);

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }
    tracing::info!(functions = registry.len(), handshake = %line, "Plugin serving");

    Server::new(registry, style).run(listener).await?;
    Ok(())
}
