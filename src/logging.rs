//! Tracing setup and the sink for plugin process output

use chrono::Local;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::plugin::config::LogOptions;
use crate::protocol::handshake::LOG_LEVEL_ENV;

/// Install the host-side subscriber. When `log_file` is given, output goes
/// there through a non-blocking appender and the returned guard must be
/// held until exit.
pub fn init_tracing(debug: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let log_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("plugin_bridge={log_level}").parse()?);

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}

/// Install the plugin-side subscriber. Stdout belongs to the handshake, so
/// everything goes to stderr where the host picks it up.
pub fn init_plugin_tracing() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed when running inside tests
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Receives the lines a plugin process writes to stdout and stderr.
///
/// Every line becomes a tracing event tagged with the plugin path. If a log
/// file is configured the line is also appended there as
/// `[time] [STREAM] text`.
pub struct PluginLogSink {
    plugin: String,
    verbose: bool,
    disable_time: bool,
    file: Mutex<Option<File>>,
}

impl PluginLogSink {
    pub async fn open(plugin: &Path, options: &LogOptions) -> std::io::Result<Self> {
        let file = match &options.file {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(dir).await?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            plugin: plugin.display().to_string(),
            verbose: options.verbose,
            disable_time: options.disable_time,
            file: Mutex::new(file),
        })
    }

    pub async fn write_stdout(&self, line: &str) {
        self.write_line("STDOUT", line).await
    }

    pub async fn write_stderr(&self, line: &str) {
        self.write_line("STDERR", line).await
    }

    async fn write_line(&self, stream_type: &str, line: &str) {
        if self.verbose {
            tracing::info!(plugin = %self.plugin, stream = stream_type, "{}", line);
        } else {
            tracing::debug!(plugin = %self.plugin, stream = stream_type, "{}", line);
        }

        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };

        let log_line = self.format_line(stream_type, line);
        if let Err(e) = file.write_all(log_line.as_bytes()).await {
            tracing::warn!(plugin = %self.plugin, "Failed to write plugin log: {}", e);
        }
    }

    fn format_line(&self, stream_type: &str, line: &str) -> String {
        if self.disable_time {
            format!("[{stream_type}] {line}\n")
        } else {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            format!("[{timestamp}] [{stream_type}] {line}\n")
        }
    }

    /// Flush and release the log file. Later writes only reach tracing.
    pub async fn close(&self) -> std::io::Result<()> {
        let file = self.file.lock().await.take();
        if let Some(mut file) = file {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs").join("plugin.log");
        let options = LogOptions {
            verbose: false,
            file: Some(log_path.clone()),
            disable_time: true,
        };

        let sink = PluginLogSink::open(Path::new("/bin/plugin"), &options)
            .await
            .unwrap();
        sink.write_stderr("starting up").await;
        sink.write_stdout("hello").await;
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "[STDERR] starting up\n[STDOUT] hello\n");
    }

    #[tokio::test]
    async fn test_sink_timestamps_and_close_twice() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let options = LogOptions {
            verbose: true,
            file: Some(file.path().to_path_buf()),
            disable_time: false,
        };

        let sink = PluginLogSink::open(Path::new("plugin"), &options).await.unwrap();
        sink.write_stderr("line").await;
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        sink.write_stderr("after close").await;

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.starts_with('['));
        assert!(contents.ends_with("] [STDERR] line\n"));
        assert!(!contents.contains("after close"));
    }

    #[tokio::test]
    async fn test_sink_without_file() {
        let sink = PluginLogSink::open(Path::new("plugin"), &LogOptions::default())
            .await
            .unwrap();
        sink.write_stdout("only tracing").await;
        sink.close().await.unwrap();
    }
}
