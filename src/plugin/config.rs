//! Plugin launch options
//!
//! [`PluginOptions`] is resolved once at `init` time and read-only after.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::handshake::TRANSPORT_ENV;

const MIN_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// How the plugin executable is started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageKind {
    /// Executed directly
    #[default]
    Native,
    /// Run as `<interpreter> <script>`
    Scripted,
}

impl LanguageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageKind::Native => "native",
            LanguageKind::Scripted => "scripted",
        }
    }
}

impl fmt::Display for LanguageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how child output is logged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Forward child output at info level instead of debug, and ask the
    /// child to log at debug level
    pub verbose: bool,
    /// Also append child output to this file
    pub file: Option<PathBuf>,
    /// Leave timestamps out of file log lines
    pub disable_time: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOptions {
    pub language: LanguageKind,
    /// Required iff `language` is scripted
    pub interpreter: Option<PathBuf>,
    /// Transport designator; when unset the `PLUGIN_BRIDGE_TRANSPORT`
    /// environment variable is consulted
    pub transport: Option<String>,
    pub log: LogOptions,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            language: LanguageKind::Native,
            interpreter: None,
            transport: None,
            log: LogOptions::default(),
            handshake_timeout: default_handshake_timeout(),
            call_timeout: default_call_timeout(),
        }
    }
}

pub(crate) fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

pub(crate) fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the plugin as a script under `interpreter`.
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.language = LanguageKind::Scripted;
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_transport(mut self, designator: impl Into<String>) -> Self {
        self.transport = Some(designator.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.log.verbose = verbose;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.file = Some(path.into());
        self
    }

    pub fn with_disable_time(mut self, disable: bool) -> Self {
        self.log.disable_time = disable;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The transport designator in effect: the explicit option, else the
    /// environment.
    pub fn transport_designator(&self) -> Option<String> {
        self.transport
            .clone()
            .or_else(|| std::env::var(TRANSPORT_ENV).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.language, &self.interpreter) {
            (LanguageKind::Scripted, None) => {
                return Err(ConfigError::MissingField(
                    "interpreter (required for scripted plugins)".into(),
                ));
            }
            (LanguageKind::Scripted, Some(path)) if path.as_os_str().is_empty() => {
                return Err(ConfigError::Validation("interpreter path is empty".into()));
            }
            _ => {}
        }

        for (name, timeout) in [
            ("handshake_timeout", self.handshake_timeout),
            ("call_timeout", self.call_timeout),
        ] {
            if timeout < MIN_TIMEOUT {
                return Err(ConfigError::Validation(format!(
                    "{name} must be at least {}ms",
                    MIN_TIMEOUT.as_millis()
                )));
            }
            if timeout > MAX_TIMEOUT {
                return Err(ConfigError::Validation(format!(
                    "{name} cannot exceed {}ms (10 minutes)",
                    MAX_TIMEOUT.as_millis()
                )));
            }
        }

        Ok(())
    }
}
