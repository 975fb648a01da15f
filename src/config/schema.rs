use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::plugin::config::{default_call_timeout, default_handshake_timeout, PluginOptions};

/// Settings for the `plugin-bridge` CLI, merged from config files and
/// `BRIDGE_` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default)]
    pub plugin: PluginSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    /// `rpc` or `mux`
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            path: None,
            interpreter: None,
            transport: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSection {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub disable_time: bool,
}

fn default_handshake_timeout_ms() -> u64 {
    default_handshake_timeout().as_millis() as u64
}

fn default_call_timeout_ms() -> u64 {
    default_call_timeout().as_millis() as u64
}

impl BridgeConfig {
    /// Resolve the plugin path and launch options.
    pub fn plugin_options(&self) -> Result<(PathBuf, PluginOptions), ConfigError> {
        let path = self
            .plugin
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingField("plugin.path".into()))?;

        let mut options = PluginOptions::new()
            .with_verbose(self.logging.verbose)
            .with_disable_time(self.logging.disable_time)
            .with_handshake_timeout(Duration::from_millis(self.plugin.handshake_timeout_ms))
            .with_call_timeout(Duration::from_millis(self.plugin.call_timeout_ms));
        if let Some(interpreter) = &self.plugin.interpreter {
            options = options.with_interpreter(interpreter);
        }
        if let Some(transport) = &self.plugin.transport {
            options = options.with_transport(transport);
        }
        if let Some(file) = &self.logging.file {
            options = options.with_log_file(file);
        }

        options.validate()?;
        Ok((path, options))
    }
}
