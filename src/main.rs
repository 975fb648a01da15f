use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use plugin_bridge::commands;
use plugin_bridge::config;
use plugin_bridge::logging;
use plugin_bridge::value;
use plugin_bridge::PluginHandle;

#[derive(Parser, Debug)]
#[command(name = "plugin-bridge")]
#[command(about = "Call named functions inside a plugin process", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Write host logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct PluginArgs {
    /// Plugin executable or script
    #[arg(short, long, value_name = "PATH")]
    plugin: Option<PathBuf>,

    /// Run the plugin as a script under this interpreter
    #[arg(long, value_name = "PATH")]
    interpreter: Option<PathBuf>,

    /// Transport style: rpc or mux
    #[arg(long)]
    transport: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List the functions the plugin registers
    List {
        #[command(flatten)]
        plugin: PluginArgs,
    },
    /// Check whether the plugin registers a function
    Has {
        #[command(flatten)]
        plugin: PluginArgs,
        name: String,
    },
    /// Call a plugin function; each argument is read as a JSON literal or
    /// else a plain string
    Call {
        #[command(flatten)]
        plugin: PluginArgs,
        name: String,
        args: Vec<String>,
    },
}

impl Command {
    fn plugin_args(&self) -> &PluginArgs {
        match self {
            Command::List { plugin } | Command::Has { plugin, .. } | Command::Call { plugin, .. } => {
                plugin
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_tracing(args.debug, args.log_file.as_deref())?;

    if let Some(path) = &args.config {
        info!("Loading configuration from: {}", path.display());
    }
    let mut config =
        config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let overrides = args.command.plugin_args();
    if let Some(path) = &overrides.plugin {
        config.plugin.path = Some(path.clone());
    }
    if let Some(interpreter) = &overrides.interpreter {
        config.plugin.interpreter = Some(interpreter.clone());
    }
    if let Some(transport) = &overrides.transport {
        config.plugin.transport = Some(transport.clone());
    }
    config::validate(&config)?;

    let (path, options) = config.plugin_options()?;
    let plugin = PluginHandle::init(&path, options)
        .await
        .with_context(|| format!("Failed to start plugin {}", path.display()))?;
    info!("Plugin started: {} ({})", plugin.path().display(), plugin.type_name());

    let outcome = tokio::select! {
        outcome = run(&plugin, &args.command) => outcome,
        _ = signal::ctrl_c() => {
            info!("Interrupted, stopping plugin");
            Ok(false)
        }
    };

    if let Err(e) = plugin.quit().await {
        error!("Failed to stop plugin cleanly: {}", e);
    }
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Returns whether the command succeeded
async fn run(plugin: &PluginHandle, command: &Command) -> anyhow::Result<bool> {
    match command {
        Command::List { .. } => {
            for name in commands::run_list(plugin).await? {
                println!("{name}");
            }
        }
        Command::Has { name, .. } => {
            let exists = commands::run_has(plugin, name).await;
            println!("{exists}");
            return Ok(exists);
        }
        Command::Call { name, args, .. } => {
            let result = commands::run_call(plugin, name, args).await?;
            let encoded = value::encode(&result)?;
            println!("{}", String::from_utf8_lossy(&encoded));
        }
    }
    Ok(true)
}
