use chrono::{DateTime, Utc};
use serde::Serialize;

/// Process-lifetime-unique session identifier; monotone, never reused.
pub type SessionId = u64;

/// Authoritative application state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DictationState {
    /// No session, worker assumed ready
    Idle,

    /// One-time model initialization in flight
    LoadingModel,

    /// Audio capture active for the given session
    Recording { session: SessionId },

    /// Stop acknowledged; awaiting the asynchronous result
    Transcribing { session: SessionId },

    /// Recoverable error state; cleared by explicit reset
    Error { reason: String },
}

impl DictationState {
    /// The session this state refers to, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            DictationState::Recording { session } | DictationState::Transcribing { session } => {
                Some(*session)
            }
            _ => None,
        }
    }
}

/// The single terminal outcome of a session. Exactly one is ever emitted per
/// session; Superseded is never confused with normal completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionOutcome {
    /// Transcription succeeded
    Transcribed { text: String },

    /// The worker reported a structured error for the session
    Failed { code: i64, message: String },

    /// Explicitly cancelled by the user
    Cancelled,

    /// Force-closed because the worker process restarted
    Superseded,
}

/// Non-state payloads riding on forwarded events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    /// Terminal session outcome
    Outcome(SessionOutcome),

    /// Transcription progress for the current session (0.0 to 1.0)
    Progress { fraction: f64 },

    /// Worker status string (e.g., "capturing", "flushing")
    Status { status: String },
}

/// One entry in the state/event feed consumed by the UI, text injection, and
/// history collaborators. A read-only snapshot: subscribers never receive a
/// live handle to machine state.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    /// Monotone feed sequence number
    pub seq: u64,

    /// State after the transition this event describes
    pub state: DictationState,

    /// The session this event refers to, if any
    pub session: Option<SessionId>,

    /// Outcome, progress, or status payload, if any
    pub payload: Option<EventPayload>,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl StateEvent {
    /// True if this event carries a session's terminal outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, Some(EventPayload::Outcome(_)))
    }
}
