//! Launch, handshake and deadline failures

use plugin_bridge::{args, BridgeError, ConfigError, PluginHandle, PluginOptions, TransportError};
use std::time::{Duration, Instant};

const DEBUGTALK: &str = env!("CARGO_BIN_EXE_debugtalk");

#[cfg(unix)]
fn executable_script(body: &str) -> tempfile::TempPath {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new()
        .prefix("fake-plugin")
        .suffix(".sh")
        .tempfile()
        .unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    file.flush().unwrap();
    let path = file.into_temp_path();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Script body prefix that writes the shell's pid to a temp file.
#[cfg(unix)]
fn pid_recorder() -> (tempfile::TempPath, String) {
    let pid_file = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let line = format!("echo $$ > '{}'", pid_file.display());
    (pid_file, line)
}

#[cfg(unix)]
fn assert_process_gone(pid_file: &std::path::Path) {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid: i32 = std::fs::read_to_string(pid_file)
        .unwrap()
        .trim()
        .parse()
        .expect("plugin never recorded its pid");
    assert_eq!(
        kill(Pid::from_raw(pid), None),
        Err(Errno::ESRCH),
        "plugin process {pid} still exists after init failed"
    );
}

#[tokio::test]
async fn test_invalid_path_is_launch_failed() {
    let err = PluginHandle::init("/no/such/plugin", PluginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::LaunchFailed { .. }), "unexpected {err:?}");
    assert!(err.to_string().contains("/no/such/plugin"));
}

#[tokio::test]
async fn test_missing_interpreter_is_launch_failed() {
    let options = PluginOptions::new().with_interpreter("/no/such/interpreter");
    let err = PluginHandle::init(DEBUGTALK, options).await.unwrap_err();
    assert!(matches!(err, BridgeError::LaunchFailed { .. }), "unexpected {err:?}");
}

#[tokio::test]
async fn test_invalid_options_rejected_before_launch() {
    let options = PluginOptions::new().with_call_timeout(Duration::from_millis(1));
    let err = PluginHandle::init(DEBUGTALK, options).await.unwrap_err();
    assert!(matches!(err, BridgeError::Config(ConfigError::Validation(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_garbage_handshake() {
    let (pid_file, record_pid) = pid_recorder();
    let script = executable_script(&format!("{record_pid}\necho 'hello there'\nsleep 5"));
    let err = PluginHandle::init(&script, PluginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::HandshakeFailed { .. }), "unexpected {err:?}");
    assert_process_gone(&pid_file);
}

#[cfg(unix)]
#[tokio::test]
async fn test_wrong_protocol_version() {
    let script = executable_script("echo '2|1|tcp|127.0.0.1:1|mux'\nsleep 5");
    let err = PluginHandle::init(&script, PluginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::HandshakeFailed { .. }));
    assert!(err.to_string().contains("core"), "{err}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_before_handshake() {
    let script = executable_script("echo 'cannot start' >&2\nexit 3");
    let err = PluginHandle::init(&script, PluginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::HandshakeFailed { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_silent_plugin_times_out() {
    let (pid_file, record_pid) = pid_recorder();
    let script = executable_script(&format!("{record_pid}\nsleep 30"));
    let options = PluginOptions::new().with_handshake_timeout(Duration::from_millis(300));

    let start = Instant::now();
    let err = PluginHandle::init(&script, options).await.unwrap_err();
    assert!(matches!(err, BridgeError::HandshakeFailed { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_process_gone(&pid_file);
}

#[cfg(unix)]
#[tokio::test]
async fn test_nobody_listening() {
    // Announces a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let script = executable_script(&format!("echo '1|1|tcp|127.0.0.1:{port}|mux'\nsleep 5"));
    let err = PluginHandle::init(&script, PluginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::HandshakeFailed { .. }), "unexpected {err:?}");
}

#[tokio::test]
async fn test_plugin_refuses_to_run_without_host() {
    let output = tokio::process::Command::new(DEBUGTALK)
        .env_remove("PLUGIN_BRIDGE_MAGIC_COOKIE")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("plugin bridge host"));
}

#[tokio::test]
async fn test_call_deadline() {
    for transport in ["rpc", "mux"] {
        let options = PluginOptions::new()
            .with_transport(transport)
            .with_call_timeout(Duration::from_millis(300));
        let plugin = PluginHandle::init(DEBUGTALK, options).await.unwrap();

        let start = Instant::now();
        let err = plugin.call("sleep_ms", &args![2000]).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert!(
            matches!(
                err,
                BridgeError::CallFailed {
                    source: TransportError::Timeout { .. },
                    ..
                }
            ),
            "{transport}: unexpected {err:?}"
        );
        assert!(err.is_retryable());

        plugin.quit().await.unwrap();
    }
}

#[tokio::test]
async fn test_simple_transport_recovers_after_timeout() {
    let options = PluginOptions::new()
        .with_transport("rpc")
        .with_call_timeout(Duration::from_millis(300));
    let plugin = PluginHandle::init(DEBUGTALK, options).await.unwrap();

    assert!(plugin.call("sleep_ms", &args![600]).await.is_err());
    // The late answer to the timed-out call is skipped
    tokio::time::sleep(Duration::from_millis(500)).await;
    let result = plugin.call("sum_ints", &args![2, 3]).await.unwrap();
    assert_eq!(result, plugin_bridge::Value::Int(5));

    plugin.quit().await.unwrap();
}
