use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{Dispenser, FunctionCaller, TransportResult, TransportStyle};
use crate::error::TransportError;
use crate::protocol::{method, DispenseParams, FrameBody, InvokeParams, MuxFrame};

type PendingStreams = DashMap<u64, mpsc::UnboundedSender<FrameBody>>;

/// Multiplexed client: every request opens its own stream id and any
/// number of requests can be in flight at once.
pub struct MuxConnection {
    outbound: mpsc::UnboundedSender<MuxFrame>,
    pending: Arc<PendingStreams>,
    next_stream: AtomicU64,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MuxConnection {
    pub async fn connect(addr: SocketAddr) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut sink, mut source) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<MuxFrame>();
        let pending: Arc<PendingStreams> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        let writer_pending = pending.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let bytes = match serde_json::to_vec(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(stream = frame.stream, "Failed to encode mux frame: {}", e);
                        writer_pending.remove(&frame.stream);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Bytes::from(bytes)).await {
                    tracing::warn!("mux connection write failed: {}", e);
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            writer_pending.clear();
        });

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("mux connection read failed: {}", e);
                        break;
                    }
                };
                let frame: MuxFrame = match serde_json::from_slice(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable mux frame: {}", e);
                        continue;
                    }
                };

                let terminal = frame.body.is_terminal();
                if let Some(waiter) = reader_pending.get(&frame.stream) {
                    let _ = waiter.send(frame.body);
                } else {
                    tracing::debug!(stream = frame.stream, "Frame for unknown stream");
                }
                if terminal {
                    reader_pending.remove(&frame.stream);
                }
            }
            // Dropping the senders wakes every waiter with a closed channel
            reader_closed.store(true, Ordering::SeqCst);
            reader_pending.clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_stream: AtomicU64::new(1),
            closed,
            tasks: vec![writer, reader],
        })
    }

    /// Open a stream for one request and hand back its receiving side.
    fn open_stream(&self, method: &str, params: Value) -> TransportResult<StreamGuard<'_>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let stream = self.next_stream.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(stream, tx);
        let guard = StreamGuard {
            stream,
            pending: &self.pending,
            rx,
        };

        // The reader may have shut down between the check above and the insert
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.outbound
            .send(MuxFrame {
                stream,
                body: FrameBody::Request {
                    method: method.to_string(),
                    params,
                },
            })
            .map_err(|_| TransportError::SendFailed("mux writer has stopped".into()))?;

        Ok(guard)
    }

    /// Single-response request
    async fn request(&self, method: &str, params: Value) -> TransportResult<Value> {
        let mut guard = self.open_stream(method, params)?;
        match guard.rx.recv().await {
            Some(FrameBody::Response { payload }) => Ok(payload),
            Some(FrameBody::Error { error }) => Err(TransportError::Remote(error)),
            Some(other) => Err(TransportError::InvalidFormat(format!(
                "unexpected frame {other:?} for single response"
            ))),
            None => Err(TransportError::Closed),
        }
    }

    /// Streamed request: gather `item` payloads until `end`
    async fn request_stream(&self, method: &str, params: Value) -> TransportResult<Vec<Value>> {
        let mut guard = self.open_stream(method, params)?;
        let mut items = Vec::new();
        loop {
            match guard.rx.recv().await {
                Some(FrameBody::Item { payload }) => items.push(payload),
                Some(FrameBody::End) => return Ok(items),
                Some(FrameBody::Error { error }) => return Err(TransportError::Remote(error)),
                Some(other) => {
                    return Err(TransportError::InvalidFormat(format!(
                        "unexpected frame {other:?} in stream"
                    )))
                }
                None => return Err(TransportError::Closed),
            }
        }
    }
}

/// Removes the pending entry when the request finishes or is abandoned
struct StreamGuard<'a> {
    stream: u64,
    pending: &'a PendingStreams,
    rx: mpsc::UnboundedReceiver<FrameBody>,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.stream);
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Dispenser for MuxConnection {
    async fn dispense(self: Box<Self>, service: &str) -> TransportResult<Arc<dyn FunctionCaller>> {
        let params = serde_json::to_value(DispenseParams {
            service: service.to_string(),
        })
        .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        self.request(method::DISPENSE, params).await?;
        Ok(Arc::new(*self))
    }
}

#[async_trait]
impl FunctionCaller for MuxConnection {
    async fn list_function_names(&self) -> TransportResult<Vec<String>> {
        tracing::debug!("mux_client ListFunctionNames() start");
        self.request_stream(method::LIST_FUNCTION_NAMES, Value::Null)
            .await?
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok(name),
                other => Err(TransportError::InvalidFormat(format!(
                    "function name must be a string, got {other}"
                ))),
            })
            .collect()
    }

    async fn invoke(&self, name: &str, args: Bytes) -> TransportResult<Bytes> {
        let args = String::from_utf8(args.to_vec())
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        let params = serde_json::to_value(InvokeParams {
            name: name.to_string(),
            args,
        })
        .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

        match self.request(method::INVOKE, params).await? {
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
        for task in &self.tasks {
            task.abort();
        }
        self.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn style(&self) -> TransportStyle {
        TransportStyle::Multiplexed
    }
}
