//! Many callers sharing one handle

use plugin_bridge::{args, PluginHandle, PluginOptions, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEBUGTALK: &str = env!("CARGO_BIN_EXE_debugtalk");

async fn concurrent_calls(transport: &str) {
    let plugin = Arc::new(
        PluginHandle::init(DEBUGTALK, PluginOptions::new().with_transport(transport))
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..32i64 {
        let plugin = plugin.clone();
        tasks.push(tokio::spawn(async move {
            let result = match i % 3 {
                0 => plugin.call("sum_ints", &args![i, i, 1]).await,
                1 => plugin.call("sum_two_string", &args![format!("s{i}"), "!"]).await,
                _ => plugin.call("concatenate", &args!["n", i]).await,
            };
            (i, result.unwrap())
        }));
    }

    for task in tasks {
        let (i, result) = task.await.unwrap();
        let expected = match i % 3 {
            0 => Value::Int(2 * i + 1),
            1 => Value::String(format!("s{i}!")),
            _ => Value::String(format!("n{i}")),
        };
        assert_eq!(result, expected, "{transport}: call {i}");
    }

    plugin.quit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_multiplexed() {
    concurrent_calls("mux").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_simple() {
    concurrent_calls("rpc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_has() {
    let plugin = Arc::new(PluginHandle::init(DEBUGTALK, PluginOptions::default()).await.unwrap());

    let names = ["sum", "sum_ints", "nope", "concatenate", "missing"];
    let mut tasks = Vec::new();
    for name in names {
        let plugin = plugin.clone();
        tasks.push(tokio::spawn(async move { (name, plugin.has(name).await) }));
    }
    for task in tasks {
        let (name, exists) = task.await.unwrap();
        assert_eq!(exists, !matches!(name, "nope" | "missing"), "{name}");
    }

    plugin.quit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiplexed_calls_overlap() {
    let plugin = Arc::new(PluginHandle::init(DEBUGTALK, PluginOptions::default()).await.unwrap());

    // Four 300ms sleeps finish well under their serial total
    let start = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let plugin = plugin.clone();
        tasks.push(tokio::spawn(async move {
            plugin.call("sleep_ms", &args![300]).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Value::Int(300));
    }
    assert!(start.elapsed() < Duration::from_millis(1100));

    plugin.quit().await.unwrap();
}
