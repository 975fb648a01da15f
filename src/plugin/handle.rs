//! The host-facing plugin handle
//!
//! A [`PluginHandle`] owns one child process, one live transport client
//! and one existence cache. It is created by [`PluginHandle::init`] and
//! torn down by [`PluginHandle::quit`]; every operation takes `&self` so
//! the handle can be shared across tasks through an `Arc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::error::{BridgeError, Result, TransportError};
use crate::logging::PluginLogSink;
use crate::plugin::cache::ExistenceCache;
use crate::plugin::config::{LanguageKind, PluginOptions};
use crate::plugin::negotiator;
use crate::plugin::process::PluginProcess;
use crate::protocol::handshake::HandshakeTracker;
use crate::transport::{FunctionCaller, TransportStyle};
use crate::value::{self, Value};

/// Lifecycle of a [`PluginHandle`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandleState {
    #[default]
    Uninitialized,
    Launching,
    Connected,
    Terminated,
}

struct Session {
    state: HandleState,
    caller: Option<Arc<dyn FunctionCaller>>,
}

pub struct PluginHandle {
    path: PathBuf,
    language: LanguageKind,
    style: TransportStyle,
    call_timeout: Duration,
    session: RwLock<Session>,
    process: Mutex<Option<PluginProcess>>,
    sink: Option<Arc<PluginLogSink>>,
    cache: ExistenceCache,
}

impl PluginHandle {
    /// Launch the plugin at `path`, negotiate a transport and return a
    /// connected handle. On failure the child, if started, is stopped
    /// before the error is returned.
    pub async fn init(path: impl AsRef<Path>, options: PluginOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        options.validate()?;

        let designator = options.transport_designator();
        let style = negotiator::choose_style(options.language, designator.as_deref());
        let sink = PluginLogSink::open(&path, &options.log)
            .await
            .map(Arc::new)
            .map_err(|e| BridgeError::LaunchFailed {
                path: path.clone(),
                reason: format!("cannot open log file: {e}"),
            })?;

        let handle = Self {
            path: path.clone(),
            language: options.language,
            style,
            call_timeout: options.call_timeout,
            session: RwLock::new(Session {
                state: HandleState::Uninitialized,
                caller: None,
            }),
            process: Mutex::new(None),
            sink: Some(sink.clone()),
            cache: ExistenceCache::new(),
        };
        handle.set_state(HandleState::Launching).await;

        let mut tracker = HandshakeTracker::new(options.handshake_timeout);
        let mut process = match PluginProcess::spawn(&path, &options, style, sink.clone()).await {
            Ok(process) => process,
            Err(e) => {
                handle.abandon_launch(None).await;
                return Err(e);
            }
        };

        let caller = match negotiator::negotiate(&mut process, &mut tracker).await {
            Ok(caller) => caller,
            Err(e) => {
                tracing::error!(plugin = %path.display(), error = %e, "Plugin negotiation failed");
                handle.abandon_launch(Some(process)).await;
                return Err(e);
            }
        };
        process.mark_connected();

        tracing::info!(
            plugin = %path.display(),
            pid = ?process.pid(),
            transport = %style,
            language = %options.language,
            duration_ms = tracker.duration_ms(),
            "Plugin connected"
        );

        *handle.process.lock().await = Some(process);
        {
            let mut session = handle.session.write().await;
            session.caller = Some(caller);
            session.state = HandleState::Connected;
        }
        Ok(handle)
    }

    /// A connected handle around an existing client, with no child
    /// process behind it.
    #[cfg(test)]
    pub(crate) fn from_caller(
        path: impl Into<PathBuf>,
        language: LanguageKind,
        caller: Arc<dyn FunctionCaller>,
        call_timeout: Duration,
    ) -> Self {
        let style = caller.style();
        Self {
            path: path.into(),
            language,
            style,
            call_timeout,
            session: RwLock::new(Session {
                state: HandleState::Connected,
                caller: Some(caller),
            }),
            process: Mutex::new(None),
            sink: None,
            cache: ExistenceCache::new(),
        }
    }

    /// Diagnostic descriptor combining transport style and language kind,
    /// e.g. `bridge-mux-native`
    pub fn type_name(&self) -> String {
        format!("bridge-{}-{}", self.style, self.language)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn style(&self) -> TransportStyle {
        self.style
    }

    pub fn language(&self) -> LanguageKind {
        self.language
    }

    pub async fn state(&self) -> HandleState {
        self.session.read().await.state
    }

    /// Whether the plugin registers `name`. Advisory: any failure to find
    /// out is reported as `false` and nothing is cached for it.
    pub async fn has(&self, name: &str) -> bool {
        if let Some(exists) = self.cache.get(name) {
            return exists;
        }

        let Some(caller) = self.live_caller().await else {
            tracing::debug!(function = name, "has() on a terminated plugin");
            return false;
        };

        let listing = tokio::time::timeout(self.call_timeout, caller.list_function_names())
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            });

        match listing {
            Ok(names) => {
                tracing::debug!(function = name, discovered = names.len(), "Function list fetched");
                self.cache.populate(name, &names)
            }
            Err(e) => {
                tracing::warn!(
                    plugin = %self.path.display(),
                    function = name,
                    error = %e,
                    "Failed to list plugin functions"
                );
                if e.is_fatal() {
                    self.terminate_after_failure(&e).await;
                }
                false
            }
        }
    }

    /// Every function the plugin registers. The names are also recorded
    /// in the existence cache.
    pub async fn function_names(&self) -> Result<Vec<String>> {
        let list_failed = |source| BridgeError::CallFailed {
            function: "ListFunctionNames".to_string(),
            source,
        };

        let caller = self
            .live_caller()
            .await
            .ok_or_else(|| list_failed(TransportError::Closed))?;
        match tokio::time::timeout(self.call_timeout, caller.list_function_names()).await {
            Ok(Ok(names)) => {
                self.cache.record_present(&names);
                Ok(names)
            }
            Ok(Err(e)) => {
                if e.is_fatal() {
                    self.terminate_after_failure(&e).await;
                }
                Err(list_failed(e))
            }
            Err(_) => Err(list_failed(TransportError::Timeout {
                timeout_ms: self.call_timeout.as_millis() as u64,
            })),
        }
    }

    /// Call `name` with `args` and decode its result.
    pub async fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        if name.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "function name must not be empty".into(),
            ));
        }

        let call_failed = |source: TransportError| BridgeError::CallFailed {
            function: name.to_string(),
            source,
        };
        let codec_failed = |source| BridgeError::Codec {
            function: name.to_string(),
            source,
        };

        let caller = self
            .live_caller()
            .await
            .ok_or_else(|| call_failed(TransportError::Closed))?;
        let encoded = value::encode_args(args).map_err(codec_failed)?;

        let start = Instant::now();
        tracing::debug!(function = name, args = args.len(), "Call start");
        let outcome = tokio::time::timeout(self.call_timeout, caller.invoke(name, encoded)).await;

        let bytes = match outcome {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(TransportError::Remote(remote))) if remote.is_function_not_found() => {
                tracing::debug!(function = name, "Function not found in plugin");
                return Err(BridgeError::FunctionNotFound {
                    function: name.to_string(),
                });
            }
            Ok(Err(e)) => {
                tracing::error!(function = name, error = %e, "Call failed");
                if e.is_fatal() {
                    self.terminate_after_failure(&e).await;
                }
                return Err(call_failed(e));
            }
            Err(_) => {
                let timeout_ms = self.call_timeout.as_millis() as u64;
                tracing::warn!(function = name, timeout_ms, "Call timed out");
                return Err(call_failed(TransportError::Timeout { timeout_ms }));
            }
        };

        let result = value::decode(&bytes).map_err(codec_failed)?;
        tracing::debug!(
            function = name,
            duration_ms = start.elapsed().as_millis() as u64,
            "Call success"
        );
        Ok(result)
    }

    /// Stop the plugin and release its resources. Safe to call more than
    /// once; later calls return `Ok`.
    pub async fn quit(&self) -> Result<()> {
        let caller = {
            let mut session = self.session.write().await;
            if session.state == HandleState::Terminated {
                tracing::debug!(plugin = %self.path.display(), "quit() on a terminated plugin");
                return Ok(());
            }
            session.state = HandleState::Terminated;
            session.caller.take()
        };

        tracing::info!(plugin = %self.path.display(), "Quitting plugin");
        self.release(caller).await
    }

    async fn live_caller(&self) -> Option<Arc<dyn FunctionCaller>> {
        let session = self.session.read().await;
        match session.state {
            HandleState::Connected => session.caller.clone(),
            _ => None,
        }
    }

    async fn set_state(&self, state: HandleState) {
        let mut session = self.session.write().await;
        tracing::debug!(plugin = %self.path.display(), from = ?session.state, to = ?state, "Handle state");
        session.state = state;
    }

    /// Connection-level failure during a call: the plugin is unusable, so
    /// move to `Terminated` and stop the child.
    async fn terminate_after_failure(&self, error: &TransportError) {
        let caller = {
            let mut session = self.session.write().await;
            if session.state != HandleState::Connected {
                return;
            }
            session.state = HandleState::Terminated;
            session.caller.take()
        };

        tracing::error!(
            plugin = %self.path.display(),
            error = %error,
            "Plugin connection lost, terminating"
        );
        if let Err(e) = self.release(caller).await {
            tracing::warn!(plugin = %self.path.display(), error = %e, "Cleanup after failure incomplete");
        }
    }

    async fn release(&self, caller: Option<Arc<dyn FunctionCaller>>) -> Result<()> {
        if let Some(caller) = caller {
            caller.close().await;
        }

        let process = self.process.lock().await.take();
        let killed = match process {
            Some(mut process) => process.kill().await,
            None => Ok(()),
        };

        if let Some(sink) = &self.sink {
            sink.close()
                .await
                .map_err(|e| BridgeError::ShutdownFailed(format!("closing plugin log: {e}")))?;
        }
        killed
    }

    async fn abandon_launch(&self, process: Option<PluginProcess>) {
        if let Some(mut process) = process {
            if let Err(e) = process.kill().await {
                tracing::warn!(plugin = %self.path.display(), error = %e, "Failed to stop plugin after launch failure");
            }
        }
        if let Some(sink) = &self.sink {
            let _ = sink.close().await;
        }
        self.set_state(HandleState::Terminated).await;
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("path", &self.path)
            .field("type", &self.type_name())
            .finish_non_exhaustive()
    }
}
