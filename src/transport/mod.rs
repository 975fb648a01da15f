use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::TransportError;

pub mod mux;
pub mod simple;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Wire discipline spoken between host and plugin, fixed at launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportStyle {
    /// One request at a time over a single connection
    #[serde(rename = "rpc")]
    Simple,
    /// Many concurrent, possibly streamed, requests over one connection
    #[default]
    #[serde(rename = "mux")]
    Multiplexed,
}

impl TransportStyle {
    /// Designator used in the environment and the handshake line. Also the
    /// name of the service dispensed for this style.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStyle::Simple => "rpc",
            TransportStyle::Multiplexed => "mux",
        }
    }

    /// Read a designator, falling back to the multiplexed style when it is
    /// absent or unrecognized.
    pub fn from_designator(designator: Option<&str>) -> Self {
        designator
            .and_then(|d| d.parse().ok())
            .unwrap_or(TransportStyle::Multiplexed)
    }
}

impl fmt::Display for TransportStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rpc" => Ok(TransportStyle::Simple),
            "mux" => Ok(TransportStyle::Multiplexed),
            other => Err(format!("unknown transport style '{other}'")),
        }
    }
}

/// The two remote operations every transport offers once dispensed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FunctionCaller: Send + Sync + 'static {
    /// Names registered in the plugin, in the order the plugin reports them
    async fn list_function_names(&self) -> TransportResult<Vec<String>>;

    /// Invoke `name` with codec-encoded arguments, returning the
    /// codec-encoded result
    async fn invoke(&self, name: &str, args: Bytes) -> TransportResult<Bytes>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn style(&self) -> TransportStyle;
}

/// A fresh connection that has not yet been asked for a service.
#[async_trait]
pub trait Dispenser: Send + 'static {
    /// Ask the plugin for `service` and turn the connection into a caller.
    async fn dispense(self: Box<Self>, service: &str) -> TransportResult<Arc<dyn FunctionCaller>>;
}

/// Open a connection of the given style to a plugin listening on `addr`.
pub async fn connect(style: TransportStyle, addr: SocketAddr) -> TransportResult<Box<dyn Dispenser>> {
    match style {
        TransportStyle::Simple => Ok(Box::new(simple::SimpleConnection::connect(addr).await?)),
        TransportStyle::Multiplexed => Ok(Box::new(mux::MuxConnection::connect(addr).await?)),
    }
}
