//! Correlated request/reply channel over one duplex stream
//!
//! ```text
//!                 ┌──────────── RpcChannel ────────────┐
//!   call() ──▶ pending[cb] ──▶ writer task ──▶ stream ──▶ peer
//!                  ▲                                      │
//!                  └── Reply{cb} ◀── reader task ◀────────┘
//!                                        │ Call
//!                                        ▼
//!                               dispatcher task ──▶ CallHandler
//! ```
//!
//! Incoming calls are handled one at a time, in arrival order, on a task of
//! their own so a handler may itself call the peer. Outgoing calls fail with
//! [`RpcError::Timeout`] when no reply arrives within the configured window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use super::frame::{self, FrameDecoder};
use super::protocol::{split_call, Envelope};
use super::RpcError;

/// Read buffer size per socket
const READ_BUFFER_SIZE: usize = 8192;

/// Serves calls arriving from the peer
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Handle one call; `Err` becomes a failed reply carrying the message
    async fn handle_call(&self, method: String, payload: Value) -> Result<Value, String>;
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>;

struct Inner {
    id: u64,
    peer: String,
    out: mpsc::UnboundedSender<Envelope>,
    pending: Pending,
    next_callback: AtomicU64,
    timeout: Duration,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn mark_closed(&self) {
        if !self.closed.send_replace(true) {
            debug!(peer = %self.peer, channel = self.id, "RPC channel closed");
        }
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

/// A live RPC connection; cheap to clone
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcChannel {
    /// Start serving `stream`
    ///
    /// `decoder` may already hold bytes read during a handshake.
    pub fn spawn<S>(
        stream: S,
        decoder: FrameDecoder,
        handler: Arc<dyn CallHandler>,
        peer: impl Into<String>,
        timeout: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            peer: peer.into(),
            out: out_tx,
            pending: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(1),
            timeout,
            closed,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (call_tx, call_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(Arc::clone(&inner), write_half, out_rx));
        tokio::spawn(read_loop(Arc::clone(&inner), read_half, decoder, call_tx));
        tokio::spawn(dispatch_loop(Arc::clone(&inner), handler, call_rx));

        Self { inner }
    }

    /// Process-unique channel id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Peer label used in logs
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Whether the channel has shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolve once the channel has shut down
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Force-disconnect; pending calls fail with `Closed`
    pub fn close(&self) {
        self.inner.mark_closed();
    }

    /// Call a method on the peer and wait for its reply
    ///
    /// # Errors
    ///
    /// `Timeout` if no reply arrives in time, `Closed` if the channel shuts
    /// down first, `Remote` if the peer answers with a failure.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let callback = self.inner.next_callback.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(callback, tx);

        let envelope = Envelope::Call {
            callback,
            method: method.to_string(),
            payload,
        };
        if self.inner.out.send(envelope).is_err() {
            self.inner.pending.lock().remove(&callback);
            return Err(RpcError::Closed);
        }
        trace!(peer = %self.inner.peer, method, callback, "RPC call sent");

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&callback);
                warn!(peer = %self.inner.peer, method, callback, "RPC call timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    callback,
                })
            }
        }
    }

    /// Call with a typed [`HostCall`](super::HostCall) or [`ModuleCall`](super::ModuleCall)
    ///
    /// # Errors
    ///
    /// As [`RpcChannel::call`], plus `Serialization` if the call cannot be encoded.
    pub async fn call_typed<C: Serialize>(&self, call: &C) -> Result<Value, RpcError> {
        let (method, payload) =
            split_call(call).map_err(|e| RpcError::Serialization(e.to_string()))?;
        self.call(&method, payload).await
    }

    /// Send a reply outside the normal dispatch path (registration ack)
    pub(crate) fn reply(&self, callback: u64, result: Result<Value, String>) {
        let _ = self.inner.out.send(reply_envelope(callback, result));
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

fn reply_envelope(callback: u64, result: Result<Value, String>) -> Envelope {
    match result {
        Ok(payload) => Envelope::Reply {
            callback,
            success: true,
            payload,
        },
        Err(message) => Envelope::Reply {
            callback,
            success: false,
            payload: Value::String(message),
        },
    }
}

async fn write_loop<S>(
    inner: Arc<Inner>,
    mut writer: WriteHalf<S>,
    mut out_rx: mpsc::UnboundedReceiver<Envelope>,
) where
    S: AsyncWrite + Send,
{
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                let bytes = match frame::encode(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %inner.peer, error = %e, "Dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(peer = %inner.peer, error = %e, "Write failed");
                    break;
                }
            }
            () = wait_closed(&mut closed) => break,
        }
    }
    let _ = writer.shutdown().await;
    inner.mark_closed();
}

async fn read_loop<S>(
    inner: Arc<Inner>,
    mut reader: ReadHalf<S>,
    mut decoder: FrameDecoder,
    call_tx: mpsc::UnboundedSender<(u64, String, Value)>,
) where
    S: AsyncRead + Send,
{
    let mut closed = inner.closed.subscribe();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'outer: loop {
        // Drain everything already buffered before reading more
        loop {
            match decoder.decode::<Envelope>() {
                Ok(Some(envelope)) => route(&inner, envelope, &call_tx),
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!(peer = %inner.peer, error = %e, "Dropping malformed RPC message");
                }
                Err(e) => {
                    warn!(peer = %inner.peer, error = %e, "Unrecoverable framing error");
                    break 'outer;
                }
            }
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(peer = %inner.peer, "Peer closed connection");
                    break;
                }
                Ok(n) => decoder.push(&buf[..n]),
                Err(e) => {
                    debug!(peer = %inner.peer, error = %e, "Read failed");
                    break;
                }
            },
            () = wait_closed(&mut closed) => break,
        }
    }

    inner.mark_closed();
}

fn route(
    inner: &Inner,
    envelope: Envelope,
    call_tx: &mpsc::UnboundedSender<(u64, String, Value)>,
) {
    match envelope {
        Envelope::Call {
            callback,
            method,
            payload,
        } => {
            let _ = call_tx.send((callback, method, payload));
        }
        Envelope::Reply {
            callback,
            success,
            payload,
        } => {
            let Some(tx) = inner.pending.lock().remove(&callback) else {
                warn!(peer = %inner.peer, callback, "Reply for unknown callback");
                return;
            };
            let result = if success {
                Ok(payload)
            } else {
                let message = match payload {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Err(RpcError::Remote(message))
            };
            let _ = tx.send(result);
        }
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    handler: Arc<dyn CallHandler>,
    mut call_rx: mpsc::UnboundedReceiver<(u64, String, Value)>,
) {
    while let Some((callback, method, payload)) = call_rx.recv().await {
        trace!(peer = %inner.peer, %method, callback, "RPC call received");
        let result = handler.handle_call(method, payload).await;
        if inner.out.send(reply_envelope(callback, result)).is_err() {
            break;
        }
    }
}
