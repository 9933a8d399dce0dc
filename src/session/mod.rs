//! Session state machine
//!
//! The authoritative owner of application state and session identity:
//! - State transitions (Idle / LoadingModel / Recording / Transcribing / Error)
//! - Session id allocation and event sequencing
//! - Stale-notification filtering (the core correctness property)
//! - Exactly-once terminal outcome delivery per session

mod events;
mod machine;

pub use events::{DictationState, EventPayload, SessionId, SessionOutcome, StateEvent};
pub use machine::SessionStateMachine;
