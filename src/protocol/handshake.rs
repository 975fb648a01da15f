//! Readiness handshake between host and plugin process
//!
//! The host starts the child with the magic cookie and the transport
//! designator in its environment. Once listening, the child prints a
//! single line on stdout:
//!
//! ```text
//! CORE|APP|NETWORK|ADDRESS|PROTOCOL
//! 1|1|tcp|127.0.0.1:40123|mux
//! ```

use crate::transport::TransportStyle;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const APP_PROTOCOL_VERSION: u32 = 1;

pub const MAGIC_COOKIE_KEY: &str = "PLUGIN_BRIDGE_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "6f2b9c1e4d8a47b3a05e9d7c2f1b8e34";

/// Tells the child which transport style to serve
pub const TRANSPORT_ENV: &str = "PLUGIN_BRIDGE_TRANSPORT";

/// Tells the child how verbosely to log on stderr
pub const LOG_LEVEL_ENV: &str = "PLUGIN_BRIDGE_LOG_LEVEL";

pub const NETWORK_TCP: &str = "tcp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake line '{line}': {reason}")]
    Malformed { line: String, reason: String },

    #[error("incompatible {which} protocol version {got}, expected {expected}")]
    IncompatibleVersion {
        which: &'static str,
        got: u32,
        expected: u32,
    },

    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("plugin speaks '{got}' but '{expected}' was requested")]
    ProtocolMismatch {
        expected: TransportStyle,
        got: TransportStyle,
    },

    #[error("plugin exited before completing the handshake")]
    ProcessExited,

    #[error("no handshake within {0:?}")]
    Timeout(Duration),
}

/// Parsed handshake announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub network: String,
    pub address: SocketAddr,
    pub protocol: TransportStyle,
}

impl HandshakeLine {
    pub fn new(address: SocketAddr, protocol: TransportStyle) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
            network: NETWORK_TCP.to_string(),
            address,
            protocol,
        }
    }

    /// Check the announcement against what the host asked for.
    pub fn validate(&self, requested: TransportStyle) -> Result<(), HandshakeError> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::IncompatibleVersion {
                which: "core",
                got: self.core_version,
                expected: CORE_PROTOCOL_VERSION,
            });
        }
        if self.app_version != APP_PROTOCOL_VERSION {
            return Err(HandshakeError::IncompatibleVersion {
                which: "app",
                got: self.app_version,
                expected: APP_PROTOCOL_VERSION,
            });
        }
        if self.network != NETWORK_TCP {
            return Err(HandshakeError::UnsupportedNetwork(self.network.clone()));
        }
        if self.protocol != requested {
            return Err(HandshakeError::ProtocolMismatch {
                expected: requested,
                got: self.protocol,
            });
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let malformed = |reason: &str| HandshakeError::Malformed {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(malformed("expected 5 '|'-separated fields"));
        }

        let core_version = parts[0]
            .parse()
            .map_err(|_| malformed("core version is not a number"))?;
        let app_version = parts[1]
            .parse()
            .map_err(|_| malformed("app version is not a number"))?;
        let address = parts[3]
            .parse()
            .map_err(|_| malformed("address is not a socket address"))?;
        let protocol = parts[4]
            .parse()
            .map_err(|_| malformed("unknown protocol"))?;

        Ok(Self {
            core_version,
            app_version,
            network: parts[2].to_string(),
            address,
            protocol,
        })
    }
}

/// Tracks timing of one launch handshake
#[derive(Debug, Clone)]
pub struct HandshakeTracker {
    pub started_at: Instant,
    pub announced_at: Option<Instant>,
    pub dispensed_at: Option<Instant>,
    pub timeout: Duration,
}

impl HandshakeTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            announced_at: None,
            dispensed_at: None,
            timeout,
        }
    }

    pub fn mark_announced(&mut self) {
        self.announced_at = Some(Instant::now());
    }

    pub fn mark_dispensed(&mut self) {
        self.dispensed_at = Some(Instant::now());
    }

    /// Time left before the handshake deadline
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started_at.elapsed())
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.dispensed_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_millis() as u64
    }
}
