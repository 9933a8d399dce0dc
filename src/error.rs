use std::time::Duration;

/// Errors produced by the orchestration core.
///
/// Transport and Protocol are per-message recoverable below the session layer;
/// `FrameTooLarge` is stream-fatal because a desynchronized frame boundary
/// would break request correlation for every call that follows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Framing or I/O failure on the worker stream.
    #[error("transport: {0}")]
    Transport(String),

    /// An incoming frame exceeded the hard size limit. Stream-fatal.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A call's deadline elapsed before its response arrived.
    #[error("call to {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// A structurally invalid message (bad version tag, missing fields,
    /// result and error both present). Treated like Timeout by callers.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A structured application error reported by the worker.
    #[error("worker error {code}: {message}")]
    Worker { code: i64, message: String },

    /// The session was force-closed because the worker process restarted.
    #[error("session superseded by worker restart")]
    Superseded,

    /// The requested operation is invalid in the current state.
    #[error("lifecycle: {0}")]
    Lifecycle(String),
}

impl CoreError {
    /// True if the error invalidates the whole stream, not just one message.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, CoreError::FrameTooLarge { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
