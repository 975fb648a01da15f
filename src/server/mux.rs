use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::Dispatcher;
use crate::protocol::{error_kind, method, FrameBody, MuxFrame, RemoteError};

/// Serve a multiplexed connection. Each request runs on its own task and
/// writes its frames through a shared writer, so slow calls do not hold up
/// fast ones.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    let (mut sink, mut source) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<MuxFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let bytes = serde_json::to_vec(&frame)?;
            sink.send(Bytes::from(bytes)).await?;
        }
        Ok::<_, std::io::Error>(())
    });

    while let Some(next) = source.next().await {
        let bytes = next?;
        let frame: MuxFrame = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping undecodable mux frame: {}", e);
                continue;
            }
        };

        let FrameBody::Request {
            method: requested,
            params,
        } = frame.body
        else {
            tracing::warn!(stream = frame.stream, "Ignoring non-request frame from host");
            continue;
        };

        let dispatcher = dispatcher.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            for body in handle(&dispatcher, &requested, params).await {
                if outbound
                    .send(MuxFrame {
                        stream: frame.stream,
                        body,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    // Host went away: let in-flight requests drain into the closed socket
    drop(outbound);
    match writer.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!("mux writer stopped: {}", e);
            Ok(())
        }
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn handle(dispatcher: &Dispatcher, requested: &str, params: Value) -> Vec<FrameBody> {
    let single = |result: Result<Value, RemoteError>| match result {
        Ok(payload) => vec![FrameBody::Response { payload }],
        Err(error) => vec![FrameBody::Error { error }],
    };

    match requested {
        method::DISPENSE => single(dispatcher.dispense(params)),
        method::LIST_FUNCTION_NAMES => match dispatcher.list_function_names() {
            Ok(names) => names
                .into_iter()
                .map(|name| FrameBody::Item {
                    payload: Value::String(name),
                })
                .chain(std::iter::once(FrameBody::End))
                .collect(),
            Err(error) => vec![FrameBody::Error { error }],
        },
        method::INVOKE => single(dispatcher.invoke(params).await),
        other => vec![FrameBody::Error {
            error: RemoteError::new(
                error_kind::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            ),
        }],
    }
}
