use super::events::{DictationState, EventPayload, SessionId, SessionOutcome, StateEvent};
use crate::error::CoreError;
use crate::protocol::{notifications, Notification};
use crate::rpc::{ReplacementRule, WorkerPort};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How many closed session ids are remembered to absorb late notifications.
const DRAIN_WINDOW: usize = 16;

struct Inner {
    state: DictationState,
    /// Next session id to allocate; ids are never reused within the process.
    next_session_id: SessionId,
    /// Feed sequence counter, stamped on every forwarded event.
    seq: u64,
    /// Recently closed sessions, still draining late notifications.
    recently_closed: VecDeque<SessionId>,
}

/// The authoritative session state machine.
///
/// Sole owner of session identity and sequencing, and the sole interpreter of
/// notification session-id fields. Commands are serialized through one lock,
/// which is also what enforces "at most one session command in flight" toward
/// the worker. External collaborators get read-only `StateEvent` snapshots.
pub struct SessionStateMachine {
    port: Arc<dyn WorkerPort>,
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<StateEvent>,
}

impl SessionStateMachine {
    pub fn new(port: Arc<dyn WorkerPort>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            port,
            inner: Mutex::new(Inner {
                state: DictationState::Idle,
                next_session_id: 1,
                seq: 0,
                recently_closed: VecDeque::new(),
            }),
            events_tx,
        })
    }

    /// Subscribes to the state/event feed. Broadcast semantics: subscribers
    /// must be idempotent and may observe lag under backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events_tx.subscribe()
    }

    /// Read-only snapshot of the current state.
    pub async fn state(&self) -> DictationState {
        self.inner.lock().await.state.clone()
    }

    /// Synchronous "can a session start now" query for the UI layer.
    pub async fn can_begin(&self) -> bool {
        matches!(self.inner.lock().await.state, DictationState::Idle)
    }

    /// Spawns the task that drives notifications into the machine.
    ///
    /// This is the only mutating consumer of the worker's notification
    /// stream; everything else is downstream of the event feed.
    pub fn spawn_notification_pump(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<Notification>,
    ) -> JoinHandle<()> {
        let machine = self;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(n) => machine.handle_notification(n).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One-time model initialization. `Idle -> LoadingModel`, then back to
    /// `Idle` on success or `Error` on failure.
    pub async fn load_model(&self, model: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.state != DictationState::Idle {
            return Err(CoreError::Lifecycle(format!(
                "cannot load model in state {:?}",
                inner.state
            )));
        }

        inner.state = DictationState::LoadingModel;
        self.emit(&mut inner, None, None);

        // The lock is held across the call on purpose: command serialization
        // toward the worker lives here, not in the RPC client.
        match self.port.load_model(model).await {
            Ok(()) => {
                info!(model, "model loaded");
                inner.state = DictationState::Idle;
                self.emit(&mut inner, None, None);
                Ok(())
            }
            Err(e) => {
                warn!(model, "model load failed: {}", e);
                inner.state = DictationState::Error {
                    reason: e.to_string(),
                };
                self.emit(&mut inner, None, None);
                Err(e)
            }
        }
    }

    /// Begins a new session. Fails with Lifecycle if one is already current;
    /// on handshake failure no visible session is created and the state stays
    /// `Idle`. The allocated id is consumed either way; ids are never reused.
    pub async fn begin(&self) -> Result<SessionId, CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.state != DictationState::Idle {
            return Err(CoreError::Lifecycle(format!(
                "cannot begin a session in state {:?}",
                inner.state
            )));
        }

        let id = inner.next_session_id;
        inner.next_session_id += 1;

        match self.port.begin_session(id).await {
            Ok(()) => {
                info!(session = id, "session started");
                inner.state = DictationState::Recording { session: id };
                self.emit(&mut inner, Some(id), None);
                Ok(id)
            }
            Err(e) => {
                warn!(session = id, "session begin rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Stops recording: a fast synchronous handshake. On acknowledgement the
    /// state moves to `Transcribing`; the result arrives asynchronously. On
    /// failure the state does not advance.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let id = match &inner.state {
            DictationState::Recording { session } => *session,
            other => {
                return Err(CoreError::Lifecycle(format!(
                    "cannot stop in state {:?}",
                    other
                )))
            }
        };

        match self.port.stop_session(id).await {
            Ok(()) => {
                info!(session = id, "stop acknowledged, awaiting transcription");
                inner.state = DictationState::Transcribing { session: id };
                self.emit(&mut inner, Some(id), None);
                Ok(())
            }
            Err(e) => {
                warn!(session = id, "stop handshake failed: {}", e);
                Err(e)
            }
        }
    }

    /// Cancels the current session. Cooperative: local state moves to `Idle`
    /// immediately and the cancel request is sent best-effort; a later result
    /// for the session is absorbed by the stale-event policy.
    pub async fn cancel(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let id = match &inner.state {
            DictationState::Recording { session } | DictationState::Transcribing { session } => {
                *session
            }
            other => {
                return Err(CoreError::Lifecycle(format!(
                    "cannot cancel in state {:?}",
                    other
                )))
            }
        };

        info!(session = id, "session cancelled");
        self.close_session(&mut inner, id, SessionOutcome::Cancelled, DictationState::Idle);
        drop(inner);

        let port = Arc::clone(&self.port);
        tokio::spawn(async move {
            if let Err(e) = port.cancel_session(id).await {
                debug!(session = id, "best-effort cancel not acknowledged: {}", e);
            }
        });

        Ok(())
    }

    /// Pushes the replacement rule set to the worker. Valid while `Idle`.
    pub async fn push_rules(&self, rules: &[ReplacementRule]) -> Result<(), CoreError> {
        let inner = self.inner.lock().await;
        if inner.state != DictationState::Idle {
            return Err(CoreError::Lifecycle(format!(
                "cannot push rules in state {:?}",
                inner.state
            )));
        }
        self.port.push_rules(rules).await
    }

    /// Supervisor restart report. Any current session is force-closed with a
    /// Superseded outcome, never confused with normal completion, and the
    /// machine lands in `Error` until an explicit reset. The supervisor calls
    /// this before reconnecting, so no stale session can act on the fresh
    /// worker.
    pub async fn worker_restarted(&self) {
        let mut inner = self.inner.lock().await;
        let error = DictationState::Error {
            reason: "worker restarted".to_string(),
        };
        if let Some(id) = inner.state.session() {
            warn!(session = id, "worker restarted; superseding current session");
            self.close_session(&mut inner, id, SessionOutcome::Superseded, error);
        } else {
            inner.state = error;
            self.emit(&mut inner, None, None);
        }
    }

    /// Clears the `Error` state back to `Idle`. No-op when already idle.
    pub async fn reset(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, DictationState::Error { .. }) {
            inner.state = DictationState::Idle;
            self.emit(&mut inner, None, None);
            Ok(())
        } else if inner.state == DictationState::Idle {
            Ok(())
        } else {
            Err(CoreError::Lifecycle(format!(
                "cannot reset in state {:?}",
                inner.state
            )))
        }
    }

    /// Applies one worker notification under the stale-event policy: only
    /// notifications tagged with the current session's id mutate state or get
    /// forwarded; anything else is dropped and logged.
    pub async fn handle_notification(&self, n: Notification) {
        let mut inner = self.inner.lock().await;

        match n.method.as_str() {
            notifications::COMPLETED | notifications::FAILED => {
                let Some(id) = n.session_id() else {
                    warn!(method = %n.method, "terminal notification without session_id dropped");
                    return;
                };
                if !self.is_live(&inner, id) {
                    self.log_stale(&inner, &n, id);
                    return;
                }
                if matches!(inner.state, DictationState::Recording { .. }) {
                    // Result before stop was acknowledged; still the live
                    // session, so it completes normally.
                    debug!(session = id, "terminal notification arrived while recording");
                }

                let outcome = if n.method == notifications::COMPLETED {
                    let text = n
                        .params
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    info!(session = id, "transcription completed");
                    SessionOutcome::Transcribed { text }
                } else {
                    let code = n.params.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
                    let message = n
                        .params
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("transcription failed")
                        .to_string();
                    warn!(session = id, code, "transcription failed: {}", message);
                    SessionOutcome::Failed { code, message }
                };
                self.close_session(&mut inner, id, outcome, DictationState::Idle);
            }

            notifications::PROGRESS => {
                let Some(id) = n.session_id() else {
                    debug!("progress notification without session_id dropped");
                    return;
                };
                if !self.is_live(&inner, id) {
                    self.log_stale(&inner, &n, id);
                    return;
                }
                let fraction = n
                    .params
                    .get("fraction")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                self.emit(
                    &mut inner,
                    Some(id),
                    Some(EventPayload::Progress { fraction }),
                );
            }

            notifications::STATUS_CHANGED => {
                // Worker-scoped unless tagged; a session tag must be live.
                if let Some(id) = n.session_id() {
                    if !self.is_live(&inner, id) {
                        self.log_stale(&inner, &n, id);
                        return;
                    }
                }
                let status = n
                    .params
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.emit(
                    &mut inner,
                    n.session_id(),
                    Some(EventPayload::Status { status }),
                );
            }

            other => {
                debug!(method = other, "unknown notification dropped");
            }
        }
    }

    fn is_live(&self, inner: &Inner, id: SessionId) -> bool {
        inner.state.session() == Some(id)
    }

    fn log_stale(&self, inner: &Inner, n: &Notification, id: SessionId) {
        if inner.recently_closed.contains(&id) {
            debug!(session = id, method = %n.method, "late notification for closed session absorbed");
        } else {
            warn!(session = id, method = %n.method, "stale notification dropped");
        }
    }

    /// Closes a session: exactly one terminal event, then the id joins the
    /// drain window so late notifications cannot reopen it.
    fn close_session(
        &self,
        inner: &mut Inner,
        id: SessionId,
        outcome: SessionOutcome,
        next_state: DictationState,
    ) {
        debug_assert_eq!(inner.state.session(), Some(id));
        inner.recently_closed.push_back(id);
        if inner.recently_closed.len() > DRAIN_WINDOW {
            inner.recently_closed.pop_front();
        }
        inner.state = next_state;
        self.emit(&mut *inner, Some(id), Some(EventPayload::Outcome(outcome)));
    }

    fn emit(&self, inner: &mut Inner, session: Option<SessionId>, payload: Option<EventPayload>) {
        inner.seq += 1;
        let event = StateEvent {
            seq: inner.seq,
            state: inner.state.clone(),
            session,
            payload,
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
