//! Plugin process spawning and supervision
//!
//! Builds the child command line, injects the bridge environment, reads
//! the handshake line and drains everything else the child prints into a
//! [`PluginLogSink`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::logging::PluginLogSink;
use crate::plugin::config::{LanguageKind, PluginOptions};
use crate::protocol::handshake::{
    HandshakeError, HandshakeLine, LOG_LEVEL_ENV, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    TRANSPORT_ENV,
};
use crate::transport::TransportStyle;

/// How long a child gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the output drains after the child is gone
const DRAIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Connected,
    Dead,
}

/// A running plugin child process
pub struct PluginProcess {
    path: PathBuf,
    interpreter: Option<PathBuf>,
    style: TransportStyle,
    pid: Option<u32>,
    state: ProcessState,
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    sink: Arc<PluginLogSink>,
    drains: Vec<JoinHandle<()>>,
}

impl PluginProcess {
    /// Start the plugin. Fails with `LaunchFailed` before anything is
    /// spawned if the executable or script is missing.
    pub async fn spawn(
        path: &Path,
        options: &PluginOptions,
        style: TransportStyle,
        sink: Arc<PluginLogSink>,
    ) -> Result<Self, BridgeError> {
        let launch_failed = |reason: String| BridgeError::LaunchFailed {
            path: path.to_path_buf(),
            reason,
        };

        let mut cmd = match options.language {
            LanguageKind::Native => {
                if !path.is_file() {
                    return Err(launch_failed("plugin executable does not exist".into()));
                }
                Command::new(path)
            }
            LanguageKind::Scripted => {
                let interpreter = options
                    .interpreter
                    .as_ref()
                    .ok_or_else(|| launch_failed("no interpreter configured".into()))?;
                if !path.is_file() {
                    return Err(launch_failed("plugin script does not exist".into()));
                }
                let mut cmd = Command::new(interpreter);
                cmd.arg(path);
                cmd
            }
        };

        let log_level = if options.log.verbose { "debug" } else { "info" };
        cmd.env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(TRANSPORT_ENV, style.as_str())
            .env(LOG_LEVEL_ENV, log_level)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); // Prevent orphans if the handle is dropped

        let mut child = cmd.spawn().map_err(|e| {
            let program = options
                .interpreter
                .as_deref()
                .filter(|_| options.language == LanguageKind::Scripted)
                .unwrap_or(path);
            launch_failed(format!("failed to spawn {}: {}", program.display(), e))
        })?;

        let pid = child.id();
        tracing::info!(
            plugin = %path.display(),
            pid = ?pid,
            language = %options.language,
            transport = %style,
            "Plugin process started"
        );

        let stdout = child.stdout.take().map(BufReader::new);
        let mut drains = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, sink.clone(), Stream::Stderr));
        }

        Ok(Self {
            path: path.to_path_buf(),
            interpreter: options.interpreter.clone(),
            style,
            pid,
            state: ProcessState::Starting,
            child,
            stdout,
            sink,
            drains,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interpreter(&self) -> Option<&Path> {
        self.interpreter.as_deref()
    }

    pub fn style(&self) -> TransportStyle {
        self.style
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Connected;
        }
    }

    /// Whether the child is still running
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Read the handshake line from stdout. Whatever the child prints
    /// afterwards is forwarded to the log sink.
    pub async fn wait_for_handshake(
        &mut self,
        timeout: Duration,
    ) -> Result<HandshakeLine, HandshakeError> {
        let mut stdout = self.stdout.take().ok_or(HandshakeError::ProcessExited)?;

        let mut line = String::new();
        let read = tokio::time::timeout(timeout, stdout.read_line(&mut line))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout))?;

        match read {
            Ok(0) | Err(_) => return Err(HandshakeError::ProcessExited),
            Ok(_) => {}
        }

        self.drains
            .push(spawn_drain(stdout, self.sink.clone(), Stream::Stdout));

        tracing::debug!(plugin = %self.path.display(), line = line.trim(), "Handshake received");
        line.parse()
    }

    /// Stop the child: SIGTERM, a short grace period, then kill. Calling
    /// this on a dead process is a no-op.
    pub async fn kill(&mut self) -> Result<(), BridgeError> {
        if self.state == ProcessState::Dead {
            return Ok(());
        }
        self.state = ProcessState::Dead;

        if self.is_alive() {
            self.terminate().await?;
        }

        for drain in self.drains.drain(..) {
            let abort = drain.abort_handle();
            if tokio::time::timeout(DRAIN_WAIT, drain).await.is_err() {
                abort.abort();
            }
        }

        tracing::info!(plugin = %self.path.display(), pid = ?self.pid, "Plugin process stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn terminate(&mut self) -> Result<(), BridgeError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, "SIGTERM failed: {}", e);
            } else if let Ok(status) =
                tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await
            {
                tracing::debug!(pid, status = ?status, "Plugin exited after SIGTERM");
                return Ok(());
            }
        }

        self.force_kill().await
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) -> Result<(), BridgeError> {
        self.force_kill().await
    }

    async fn force_kill(&mut self) -> Result<(), BridgeError> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Exited between the liveness check and the kill
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(BridgeError::ShutdownFailed(format!(
                "failed to kill {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_drain<R>(reader: R, sink: Arc<PluginLogSink>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                Stream::Stdout => sink.write_stdout(&line).await,
                Stream::Stderr => sink.write_stderr(&line).await,
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugin::config::LogOptions;
    use std::io::Write;

    fn script(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
        writeln!(file, "{body}").unwrap();
        file.into_temp_path()
    }

    fn shell() -> PluginOptions {
        PluginOptions::new().with_interpreter("/bin/sh")
    }

    async fn sink() -> Arc<PluginLogSink> {
        Arc::new(
            PluginLogSink::open(Path::new("test"), &LogOptions::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let result = PluginProcess::spawn(
            Path::new("/definitely/not/a/plugin"),
            &PluginOptions::default(),
            TransportStyle::Multiplexed,
            sink().await,
        )
        .await;
        assert!(matches!(result, Err(BridgeError::LaunchFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let path = script("exit 0");
        let options = PluginOptions::new().with_interpreter("/definitely/not/an/interpreter");
        let result =
            PluginProcess::spawn(&path, &options, TransportStyle::Multiplexed, sink().await).await;
        assert!(matches!(result, Err(BridgeError::LaunchFailed { .. })));
    }

    #[tokio::test]
    async fn test_environment_and_handshake() {
        let path = script(
            "echo \"1|1|tcp|127.0.0.1:4000|$PLUGIN_BRIDGE_TRANSPORT\"\nsleep 5",
        );
        let mut process = PluginProcess::spawn(
            &path,
            &shell(),
            TransportStyle::Simple,
            sink().await,
        )
        .await
        .unwrap();
        assert_eq!(process.state(), ProcessState::Starting);

        let line = process
            .wait_for_handshake(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(line.protocol, TransportStyle::Simple);
        assert_eq!(line.address.port(), 4000);

        process.kill().await.unwrap();
        assert_eq!(process.state(), ProcessState::Dead);
        assert!(!process.is_alive());
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_process_exited() {
        let path = script("echo oops >&2\nexit 1");
        let mut process = PluginProcess::spawn(
            &path,
            &shell(),
            TransportStyle::Multiplexed,
            sink().await,
        )
        .await
        .unwrap();

        let err = process
            .wait_for_handshake(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, HandshakeError::ProcessExited);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let path = script("sleep 5");
        let mut process = PluginProcess::spawn(
            &path,
            &shell(),
            TransportStyle::Multiplexed,
            sink().await,
        )
        .await
        .unwrap();

        let err = process
            .wait_for_handshake(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
        process.kill().await.unwrap();
    }
}
