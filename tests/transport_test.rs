//! Both transport styles against an in-process plugin server

use bytes::Bytes;
use plugin_bridge::server::Server;
use plugin_bridge::transport::{self, FunctionCaller, TransportStyle};
use plugin_bridge::value::{decode, encode_args};
use plugin_bridge::{args, FunctionRegistry, TransportError, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register("f2", |args| Ok(Value::Int(args.len() as i64)))
        .register("f1", |mut args| Ok(args.pop().unwrap_or_default()));
    registry
}

async fn start(style: TransportStyle) -> (std::net::SocketAddr, JoinHandle<std::io::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(Server::new(registry(), style).run(listener));
    (addr, server)
}

async fn dispensed(style: TransportStyle) -> (Arc<dyn FunctionCaller>, JoinHandle<std::io::Result<()>>) {
    let (addr, server) = start(style).await;
    let caller = transport::connect(style, addr)
        .await
        .unwrap()
        .dispense(style.as_str())
        .await
        .unwrap();
    (caller, server)
}

#[tokio::test]
async fn test_same_contract_for_both_styles() {
    for style in [TransportStyle::Simple, TransportStyle::Multiplexed] {
        let (caller, server) = dispensed(style).await;
        assert_eq!(caller.style(), style);

        let names = caller.list_function_names().await.unwrap();
        assert_eq!(names, vec!["f1", "f2"], "{style}");
        // Listing has no side effects
        assert_eq!(caller.list_function_names().await.unwrap(), names);

        let encoded = encode_args(&args![1, "x", vec![1.5, 2.0]]).unwrap();
        let result = caller.invoke("f1", encoded.clone()).await.unwrap();
        assert_eq!(
            decode(&result).unwrap(),
            Value::Seq(vec![Value::Float(1.5), Value::Float(2.0)])
        );
        let result = caller.invoke("f2", encoded).await.unwrap();
        assert_eq!(decode(&result).unwrap(), Value::Int(3));

        let err = caller
            .invoke("f3", Bytes::from_static(b"[]"))
            .await
            .unwrap_err();
        match err {
            TransportError::Remote(remote) => assert!(remote.is_function_not_found(), "{style}"),
            other => panic!("{style}: unexpected {other:?}"),
        }

        caller.close().await;
        assert!(caller.is_closed());
        server.abort();
    }
}

#[tokio::test]
async fn test_malformed_args_reported_by_plugin() {
    for style in [TransportStyle::Simple, TransportStyle::Multiplexed] {
        let (caller, server) = dispensed(style).await;

        let err = caller
            .invoke("f1", Bytes::from_static(b"{\"not\":\"a list\"}"))
            .await
            .unwrap_err();
        match err {
            TransportError::Remote(remote) => assert_eq!(remote.kind, "MalformedPayload"),
            other => panic!("{style}: unexpected {other:?}"),
        }

        server.abort();
    }
}

#[tokio::test]
async fn test_dispense_of_unoffered_service_fails() {
    let (addr, server) = start(TransportStyle::Simple).await;

    let result = transport::connect(TransportStyle::Simple, addr)
        .await
        .unwrap()
        .dispense("mux")
        .await;
    match result {
        Err(TransportError::Remote(remote)) => assert!(remote.is_service_not_found()),
        Err(other) => panic!("unexpected {other:?}"),
        Ok(_) => panic!("dispense of an unoffered service succeeded"),
    }

    server.abort();
}

#[tokio::test]
async fn test_server_gone_is_fatal() {
    for style in [TransportStyle::Simple, TransportStyle::Multiplexed] {
        let (caller, server) = dispensed(style).await;
        server.abort();
        let _ = server.await;

        let err = caller
            .invoke("f1", Bytes::from_static(b"[1]"))
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{style}: {err:?}");
        assert!(caller.is_closed());
    }
}

#[tokio::test]
async fn test_server_ends_when_host_disconnects() {
    let (caller, server) = dispensed(TransportStyle::Multiplexed).await;
    caller.close().await;
    drop(caller);

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .expect("server should stop once the host is gone");
    assert!(outcome.unwrap().is_ok());
}
