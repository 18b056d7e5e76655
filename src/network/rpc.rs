//! Bidirectional request/response RPC over one byte stream pair.
//!
//! Each channel runs one read loop and one writer task. Inbound requests are
//! dispatched to their handler in a separate task, so a slow handler never
//! blocks the read loop; replies are matched to calls by id. Any fatal
//! condition trips the channel's cancellation token, which stops both loops
//! and rejects every outstanding call with [`RpcError::Aborted`].

use crate::constants::rpc::{HANDLER_ERROR, PROTOCOL_ERROR_BUDGET};
use crate::network::message::{self, classify, CallId, ErrorObject, RpcMessage};
use crate::network::wire::{decode_payload, serialize_frame, FrameReader};
use ciborium::Value;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("RPC channel aborted")]
    Aborted,
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Failed to decode frame: {0}")]
    Decode(String),
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<ErrorObject> for RpcError {
    fn from(e: ErrorObject) -> Self {
        RpcError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, String>>;
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Fixed dispatch table keyed by method name
#[derive(Clone, Default)]
pub struct RpcHandlers {
    handlers: HashMap<String, Handler>,
}

impl RpcHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |params| -> HandlerFuture { Box::pin(handler(params)) });
        self.handlers.insert(method.to_string(), boxed);
        self
    }

    fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }
}

type PendingCalls = HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>;

struct Shared {
    /// `None` once the channel has shut down
    pending: Mutex<Option<PendingCalls>>,
    next_id: AtomicI64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Tripped when the channel starts shutting down
    cancel: CancellationToken,
    /// Tripped once both loops have finished
    done: CancellationToken,
}

impl Shared {
    fn abort(&self) {
        self.cancel.cancel();
        if let Some(pending) = self.pending.lock().take() {
            for (_, tx) in pending {
                let _ = tx.send(Err(RpcError::Aborted));
            }
        }
    }

    fn send(&self, value: &Value) -> Result<(), RpcError> {
        let frame = serialize_frame(value)?;
        self.outbound.send(frame).map_err(|_| RpcError::Aborted)
    }

    fn resolve(&self, id: i64, outcome: Result<Value, RpcError>) {
        let slot = self.pending.lock().as_mut().and_then(|p| p.remove(&id));
        match slot {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!("Ignoring reply for unknown call id {}", id),
        }
    }
}

/// Cloneable handle to an open RPC channel
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

impl PeerHandle {
    /// Call `method` on the remote and wait for its reply
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.shared.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(RpcError::Aborted),
        }

        if let Err(e) = self.shared.send(&message::request(method, params, id)) {
            if let Some(pending) = self.shared.pending.lock().as_mut() {
                pending.remove(&id);
            }
            return Err(e);
        }

        rx.await.map_err(|_| RpcError::Aborted)?
    }

    /// Fire-and-forget call; the remote never replies
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Aborted);
        }
        self.shared.send(&message::notification(method, params))
    }

    pub fn close(&self) {
        self.shared.abort();
    }

    /// Resolves once the channel has fully shut down
    pub async fn closed(&self) {
        self.shared.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Start an RPC channel over `reader`/`writer`, serving `handlers`.
pub fn open<R, W>(reader: R, writer: W, handlers: RpcHandlers) -> PeerHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        pending: Mutex::new(Some(HashMap::new())),
        next_id: AtomicI64::new(0),
        outbound,
        cancel: CancellationToken::new(),
        done: CancellationToken::new(),
    });

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, shared.clone()));
    let driver = shared.clone();
    tokio::spawn(async move {
        match read_loop(reader, driver.clone(), handlers).await {
            Ok(()) => tracing::debug!("RPC channel closed"),
            Err(e) => tracing::debug!("RPC channel terminated: {}", e),
        }
        driver.abort();
        let _ = writer_task.await;
        driver.done.cancel();
    });

    PeerHandle { shared }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Queued frames go out before a pending shutdown is honoured
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            _ = shared.cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        tokio::select! {
            result = writer.write_all(&frame) => {
                if let Err(e) = result {
                    tracing::debug!("RPC write failed: {}", e);
                    break;
                }
            }
            _ = shared.cancel.cancelled() => break,
        }
    }
    let _ = writer.shutdown().await;
    shared.abort();
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>, handlers: RpcHandlers) -> Result<(), RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    let mut protocol_errors = 0u32;

    loop {
        let payload = tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            frame = frames.read_frame() => match frame? {
                Some(payload) => payload,
                None => return Ok(()),
            },
        };

        let value = match decode_payload(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Undecodable RPC frame: {}", e);
                protocol_error(&shared, &mut protocol_errors, ErrorObject::parse_error())?;
                continue;
            }
        };

        let message = match classify(value) {
            Ok(message) => message,
            Err(error) => {
                protocol_error(&shared, &mut protocol_errors, error)?;
                continue;
            }
        };

        match message {
            RpcMessage::PeerBreak { error } => {
                return Err(match error {
                    Some(error) => error.into(),
                    None => RpcError::InvalidResponse("peer reported rpc protocol error".into()),
                });
            }
            RpcMessage::Result { result, id } => shared.resolve(id, Ok(result)),
            RpcMessage::Error { error, id } => shared.resolve(id, Err(error.into())),
            RpcMessage::Call { method, params, id } => {
                let Some(handler) = handlers.get(&method) else {
                    if let CallId::Int(id) = id {
                        shared.send(&message::error(&ErrorObject::method_not_found(), Some(id)))?;
                    } else {
                        tracing::debug!("Dropping notification for unknown method {}", method);
                    }
                    continue;
                };
                match id {
                    CallId::Invalid => {
                        protocol_error(&shared, &mut protocol_errors, ErrorObject::invalid_request())?
                    }
                    CallId::Absent => {
                        tokio::spawn(async move {
                            if let Err(e) = handler(params).await {
                                tracing::debug!("Notification handler {} failed: {}", method, e);
                            }
                        });
                    }
                    CallId::Int(id) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            let reply = match handler(params).await {
                                Ok(value) => message::result(value, id),
                                Err(e) => {
                                    message::error(&ErrorObject::new(HANDLER_ERROR, e), Some(id))
                                }
                            };
                            if let Err(e) = shared.send(&reply) {
                                // Unsendable result: fail the remote call instead of leaving it hanging
                                tracing::debug!("Reply to {} (id {}) not sent: {}", method, id, e);
                                let error = ErrorObject::new(HANDLER_ERROR, e.to_string());
                                if let Err(e) = shared.send(&message::error(&error, Some(id))) {
                                    tracing::debug!("Dropping reply to {} (id {}): {}", method, id, e);
                                }
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Report a malformed frame, or give up once the budget is spent
fn protocol_error(shared: &Shared, count: &mut u32, error: ErrorObject) -> Result<(), RpcError> {
    *count += 1;
    if *count > PROTOCOL_ERROR_BUDGET {
        return Err(RpcError::InvalidResponse(format!(
            "too many malformed frames ({})",
            count
        )));
    }
    shared.send(&message::error(&error, None))
}
