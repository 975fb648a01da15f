use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::{Path, PathBuf};

use super::schema::BridgeConfig;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "BRIDGE_";

/// Load from `plugin-bridge.{toml,json,yaml,yml}` in the working
/// directory, then `explicit` if given, then `BRIDGE_` environment
/// variables (`BRIDGE_PLUGIN__CALL_TIMEOUT_MS=500`).
pub fn load(explicit: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let mut figment = Figment::new()
        .merge(Toml::file("plugin-bridge.toml"))
        .merge(Json::file("plugin-bridge.json"))
        .merge(Yaml::file("plugin-bridge.yaml"))
        .merge(Yaml::file("plugin-bridge.yml"));

    if let Some(path) = explicit {
        figment = merge_file(figment, path)?;
    }

    extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Load a single config file plus environment overrides.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<BridgeConfig, ConfigError> {
    let figment = merge_file(Figment::new(), path.as_ref())?;
    extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        Some("yaml") | Some("yml") => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::Parse(
            "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
        )),
    }
}

fn extract(figment: Figment) -> Result<BridgeConfig, ConfigError> {
    let config: BridgeConfig = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &BridgeConfig) -> Result<(), ConfigError> {
    if let Some(transport) = &config.plugin.transport {
        if !matches!(transport.as_str(), "rpc" | "mux") {
            return Err(ConfigError::Validation(format!(
                "Unknown transport '{transport}', expected 'rpc' or 'mux'"
            )));
        }
    }

    if let Some(path) = &config.plugin.path {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("plugin.path is empty".into()));
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: BridgeConfig) -> Result<BridgeConfig, ConfigError> {
    for path in [
        &mut config.plugin.path,
        &mut config.plugin.interpreter,
        &mut config.logging.file,
    ]
    .into_iter()
    .flatten()
    {
        *path = substitute_path(path)?;
    }
    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf, ConfigError> {
    match path.to_str() {
        Some(text) => substitute_env_vars(text).map(PathBuf::from),
        None => Ok(path.to_path_buf()),
    }
}

/// Expand `${VAR}` and `${VAR:-default}`.
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let value = match var_name.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(var_name).map_err(|_| {
                ConfigError::Validation(format!("Environment variable '{var_name}' not found"))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml() {
        let file = config_file(
            ".toml",
            r#"
[plugin]
path = "/opt/plugins/debugtalk"
transport = "rpc"
callTimeoutMs = 1500

[logging]
verbose = true
"#,
        );

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(
            config.plugin.path.as_deref(),
            Some(Path::new("/opt/plugins/debugtalk"))
        );
        assert_eq!(config.plugin.handshake_timeout_ms, 10_000);
        assert!(config.logging.verbose);

        let (path, options) = config.plugin_options().unwrap();
        assert_eq!(path, PathBuf::from("/opt/plugins/debugtalk"));
        assert_eq!(options.transport.as_deref(), Some("rpc"));
        assert_eq!(options.call_timeout, Duration::from_millis(1500));
        assert!(options.log.verbose);
    }

    #[test]
    fn test_load_json_scripted() {
        let file = config_file(
            ".json",
            r#"{"plugin": {"path": "plugin.py", "interpreter": "/usr/bin/python3"}}"#,
        );

        let (_, options) = load_from_path(file.path())
            .unwrap()
            .plugin_options()
            .unwrap();
        assert_eq!(
            options.language,
            crate::plugin::config::LanguageKind::Scripted
        );
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let file = config_file(".yaml", "plugin:\n  path: p\n  transport: grpc\n");
        assert!(matches!(
            load_from_path(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let file = config_file(".ini", "path = p");
        assert!(matches!(
            load_from_path(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_plugin_path() {
        let config = BridgeConfig::default();
        assert!(matches!(
            config.plugin_options(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_env_substitution_default() {
        let result =
            substitute_env_vars("${PLUGIN_BRIDGE_TEST_UNSET_DIR:-/tmp}/debugtalk").unwrap();
        assert_eq!(result, "/tmp/debugtalk");

        assert!(substitute_env_vars("${PLUGIN_BRIDGE_TEST_UNSET_DIR}").is_err());
    }
}
