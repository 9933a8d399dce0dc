use crate::error::CoreError;
use crate::protocol::{encode_frame, methods, FrameDecoder, Message, Notification};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Default deadline for ordinary request/response exchanges.
pub const DEFAULT_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Minimum deadline for one-time heavy operations (model initialization).
pub const LOAD_MODEL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Minimum timeout class for a method.
///
/// Callers may pass a longer deadline; shorter ones are clamped up so a slow
/// heavy operation is never misreported as a dead worker.
pub fn min_timeout(method: &str) -> std::time::Duration {
    match method {
        methods::LOAD_MODEL => LOAD_MODEL_TIMEOUT,
        _ => std::time::Duration::from_millis(250),
    }
}

type PendingSlot = oneshot::Sender<Result<Value, CoreError>>;

/// Correlated RPC over one worker stream pair.
///
/// One long-lived read task owns the output stream; any number of logical
/// callers may issue requests concurrently, correlated strictly by request id.
/// Call serialization (at most one session command in flight) is not this
/// layer's job; the session state machine enforces it.
pub struct RpcClient {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<HashMap<u64, PendingSlot>>>,
    next_id: AtomicU64,
    notify_tx: broadcast::Sender<Notification>,
    closed_rx: watch::Receiver<bool>,
}

impl RpcClient {
    /// Wraps a worker's stream pair and spawns the read loop.
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (notify_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: Arc<Mutex<HashMap<u64, PendingSlot>>> = Arc::new(Mutex::new(HashMap::new()));

        let client = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            notify_tx: notify_tx.clone(),
            closed_rx,
        });

        tokio::spawn(read_loop(reader, pending, notify_tx, closed_tx));

        client
    }

    /// Issues a request and suspends until its response, or until the
    /// deadline. A response arriving after the deadline is discarded, never
    /// delivered; the request id is fresh and never reused.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, CoreError> {
        let timeout = timeout.max(min_timeout(method));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Transport(
                "worker stream closed while call was pending".to_string(),
            )),
            Err(_) => {
                // Remove the pending slot so a late response cannot resolve
                // this call a second time. The response-dispatch path and this
                // path both remove under the same lock; exactly one wins.
                if self.pending.lock().await.remove(&id).is_some() {
                    debug!(method, id, "call timed out; pending slot removed");
                }
                Err(CoreError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Like `call`, with the method's own timeout class.
    pub async fn call_default(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        self.call(method, params, DEFAULT_CALL_TIMEOUT).await
    }

    /// Subscribes to worker notifications. Broadcast: every active subscriber
    /// sees every notification, with no at-most-once guarantee, so consumers
    /// must be idempotent.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Watch that flips to `true` when the read loop terminates.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Emits one frame atomically: the write half is held for the whole frame.
    async fn write_frame(&self, message: &Message) -> Result<(), CoreError> {
        let bytes = encode_frame(message)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| CoreError::Transport(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| CoreError::Transport(format!("flush failed: {}", e)))?;
        Ok(())
    }
}

/// The single long-lived read loop over the worker's output stream.
async fn read_loop<R>(
    mut reader: R,
    pending: Arc<Mutex<HashMap<u64, PendingSlot>>>,
    notify_tx: broadcast::Sender<Notification>,
    closed_tx: watch::Sender<bool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    'outer: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("worker output stream closed");
                break;
            }
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(message)) => {
                            dispatch(message, &pending, &notify_tx).await;
                        }
                        Ok(None) => break,
                        Err(e) if e.is_stream_fatal() => {
                            warn!("stream-fatal framing error: {}", e);
                            break 'outer;
                        }
                        Err(e) => {
                            // Malformed single message; the stream stays up.
                            warn!("discarding malformed frame: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("worker read failed: {}", e);
                break;
            }
        }
    }

    // Fail every in-flight call exactly once, then signal closure.
    let mut table = pending.lock().await;
    for (id, slot) in table.drain() {
        debug!(id, "failing pending call: stream closed");
        let _ = slot.send(Err(CoreError::Transport(
            "worker stream closed".to_string(),
        )));
    }
    drop(table);
    let _ = closed_tx.send(true);
}

async fn dispatch(
    message: Message,
    pending: &Mutex<HashMap<u64, PendingSlot>>,
    notify_tx: &broadcast::Sender<Notification>,
) {
    match message {
        Message::Response { id, result } => {
            let slot = pending.lock().await.remove(&id);
            match slot {
                Some(slot) => {
                    let outcome = result.map_err(|e| CoreError::Worker {
                        code: e.code,
                        message: e.message,
                    });
                    // Receiver may have given up between removal and send;
                    // that call already resolved with Timeout.
                    let _ = slot.send(outcome);
                }
                None => {
                    debug!(id, "discarding late or unknown response");
                }
            }
        }
        Message::Notification(n) => {
            // No subscribers is fine; notifications are fan-out only.
            let _ = notify_tx.send(n);
        }
        Message::Request { id, method, .. } => {
            warn!(id, method = %method, "worker sent a request; protocol is client-initiated only");
        }
    }
}
