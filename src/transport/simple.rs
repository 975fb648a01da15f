use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{Dispenser, FunctionCaller, TransportResult, TransportStyle};
use crate::error::TransportError;
use crate::protocol::{
    method, DispenseParams, InvokeParams, JsonRpcRequest, JsonRpcResponse,
};

struct LineStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a response line read so far. Survives a cancelled read so
    /// the next request can finish and discard the stale line.
    partial: Vec<u8>,
    /// Request line being written and how much of it reached the socket.
    /// A line cancelled part way is completed before the next one starts.
    outgoing: Vec<u8>,
    sent: usize,
}

impl LineStream {
    async fn write_line(&mut self, line: Vec<u8>) -> std::io::Result<()> {
        // A cancelled line the server never saw any of is dropped
        if self.sent == 0 {
            self.outgoing.clear();
        }
        self.drain_outgoing().await?;

        self.outgoing = line;
        self.drain_outgoing().await?;
        self.writer.flush().await
    }

    async fn drain_outgoing(&mut self) -> std::io::Result<()> {
        while self.sent < self.outgoing.len() {
            let n = self.writer.write(&self.outgoing[self.sent..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            self.sent += n;
        }
        self.outgoing.clear();
        self.sent = 0;
        Ok(())
    }
}

/// Request/response client: the connection carries exactly one request at
/// a time, so concurrent callers queue on the stream lock.
pub struct SimpleConnection {
    stream: Mutex<LineStream>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
}

impl SimpleConnection {
    pub async fn connect(addr: SocketAddr) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (read, write) = stream.into_split();

        Ok(Self {
            stream: Mutex::new(LineStream {
                reader: BufReader::new(read),
                writer: write,
                partial: Vec::new(),
                outgoing: Vec::new(),
                sent: 0,
            }),
            next_id: AtomicI64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        line.push(b'\n');

        let mut stream = self.stream.lock().await;

        if let Err(e) = stream.write_line(line).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportError::SendFailed(e.to_string()));
        }

        loop {
            let response = self.read_response(&mut stream).await?;
            // An earlier request that timed out may have left its answer behind
            if response.id < id {
                tracing::debug!(stale_id = response.id, expected_id = id, "Skipping stale response");
                continue;
            }
            if response.id != id {
                return Err(TransportError::InvalidFormat(format!(
                    "response id {} does not match request id {id}",
                    response.id
                )));
            }
            return response.into_result().map_err(TransportError::Remote);
        }
    }

    async fn read_response(&self, stream: &mut LineStream) -> TransportResult<JsonRpcResponse> {
        let LineStream {
            reader, partial, ..
        } = stream;
        let n = reader.read_until(b'\n', partial).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            TransportError::ReceiveFailed(e.to_string())
        })?;

        if n == 0 || partial.last() != Some(&b'\n') {
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        let line = std::mem::take(partial);
        serde_json::from_slice(&line).map_err(|e| TransportError::InvalidFormat(e.to_string()))
    }
}

#[async_trait]
impl Dispenser for SimpleConnection {
    async fn dispense(self: Box<Self>, service: &str) -> TransportResult<Arc<dyn FunctionCaller>> {
        let params = serde_json::to_value(DispenseParams {
            service: service.to_string(),
        })
        .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        self.request(method::DISPENSE, Some(params)).await?;
        Ok(Arc::new(*self))
    }
}

#[async_trait]
impl FunctionCaller for SimpleConnection {
    async fn list_function_names(&self) -> TransportResult<Vec<String>> {
        tracing::debug!("rpc_client ListFunctionNames() start");
        let result = self.request(method::LIST_FUNCTION_NAMES, None).await?;
        serde_json::from_value(result).map_err(|e| TransportError::InvalidFormat(e.to_string()))
    }

    async fn invoke(&self, name: &str, args: Bytes) -> TransportResult<Bytes> {
        let args = String::from_utf8(args.to_vec())
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        let params = serde_json::to_value(InvokeParams {
            name: name.to_string(),
            args,
        })
        .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

        match self.request(method::INVOKE, Some(params)).await? {
            Value::String(text) => Ok(Bytes::from(text)),
            other => Err(TransportError::InvalidFormat(format!(
                "invoke result must be codec text, got {other}"
            ))),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // An in-flight request owns the stream; the process teardown closes
        // the socket underneath it.
        if let Ok(mut stream) = self.stream.try_lock() {
            if let Err(e) = stream.writer.shutdown().await {
                tracing::debug!("Failed to shut down rpc connection: {}", e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn style(&self) -> TransportStyle {
        TransportStyle::Simple
    }
}
