//! Operations behind the `plugin-bridge` subcommands

use tracing::{debug, info};

use crate::error::Result;
use crate::plugin::PluginHandle;
use crate::value::{self, Value};

/// Read a command-line argument as a codec literal (`3`, `2.5`, `true`,
/// `[1,2]`, `"quoted"`), falling back to a plain string.
pub fn parse_arg(raw: &str) -> Value {
    match value::decode(raw.as_bytes()) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

pub async fn run_list(plugin: &PluginHandle) -> Result<Vec<String>> {
    let names = plugin.function_names().await?;
    info!("{} exposes {} function(s)", plugin.path().display(), names.len());
    Ok(names)
}

pub async fn run_has(plugin: &PluginHandle, name: &str) -> bool {
    let exists = plugin.has(name).await;
    debug!(function = name, exists, "Existence check");
    exists
}

pub async fn run_call(plugin: &PluginHandle, name: &str, raw_args: &[String]) -> Result<Value> {
    let args: Vec<Value> = raw_args.iter().map(|raw| parse_arg(raw)).collect();
    debug!(function = name, args = ?args, "Calling plugin function");
    plugin.call(name, &args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_literals() {
        assert_eq!(parse_arg("3"), Value::Int(3));
        assert_eq!(parse_arg("3.4"), Value::Float(3.4));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("\"7\""), Value::String("7".into()));
        assert_eq!(
            parse_arg("[1,\"a\"]"),
            Value::Seq(vec![Value::Int(1), Value::String("a".into())])
        );
    }

    #[test]
    fn test_parse_arg_falls_back_to_string() {
        assert_eq!(parse_arg("abc"), Value::String("abc".into()));
        assert_eq!(parse_arg("a b"), Value::String("a b".into()));
    }
}
