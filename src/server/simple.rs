use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::Dispatcher;
use crate::protocol::{error_kind, method, JsonRpcRequest, JsonRpcResponse, RemoteError};

/// Answer newline-delimited JSON-RPC requests one at a time until the host
/// closes the connection.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => {
                let id = request.id;
                match handle(&dispatcher, request).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(error) => JsonRpcResponse::failure(id, error),
                }
            }
            Err(e) => {
                tracing::warn!("Undecodable rpc request: {}", e);
                JsonRpcResponse::failure(0, RemoteError::new(error_kind::MALFORMED_PAYLOAD, e.to_string()))
            }
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        write.write_all(&bytes).await?;
        write.flush().await?;
    }

    Ok(())
}

async fn handle(dispatcher: &Dispatcher, request: JsonRpcRequest) -> Result<Value, RemoteError> {
    let params = request.params.unwrap_or(Value::Null);
    match request.method.as_str() {
        method::DISPENSE => dispatcher.dispense(params),
        method::LIST_FUNCTION_NAMES => dispatcher
            .list_function_names()
            .map(|names| Value::Array(names.into_iter().map(Value::String).collect())),
        method::INVOKE => dispatcher.invoke(params).await,
        other => Err(RemoteError::new(
            error_kind::METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        )),
    }
}
