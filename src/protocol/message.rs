use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried by every message on the wire.
pub const PROTOCOL_VERSION: u32 = 1;

/// Method names in the worker contract.
///
/// The catalog is bilateral: the worker may grow methods we do not call, and
/// notifications we do not know are dropped by the session layer.
pub mod methods {
    pub const PING: &str = "worker.ping";
    pub const INFO: &str = "worker.info";
    pub const SHUTDOWN: &str = "worker.shutdown";
    pub const LOAD_MODEL: &str = "model.load";
    pub const SESSION_BEGIN: &str = "session.begin";
    pub const SESSION_STOP: &str = "session.stop";
    pub const SESSION_CANCEL: &str = "session.cancel";
    pub const RULES_PUSH: &str = "rules.push";
}

/// Notification method names emitted by the worker.
pub mod notifications {
    pub const STATUS_CHANGED: &str = "status.changed";
    pub const PROGRESS: &str = "transcription.progress";
    pub const COMPLETED: &str = "transcription.completed";
    pub const FAILED: &str = "transcription.failed";
}

/// Structured error object in a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A notification: method + params, no request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    /// The session id this notification refers to, if it carries one.
    pub fn session_id(&self) -> Option<u64> {
        self.params.get("session_id").and_then(Value::as_u64)
    }
}

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        result: std::result::Result<Value, WireError>,
    },
    Notification(Notification),
}

/// Raw frame as it appears on the wire; validation happens in `Message::parse`.
#[derive(Debug, Serialize, Deserialize)]
struct RawFrame {
    v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

impl Message {
    /// Parses one frame. A failure here is a recoverable per-message error.
    pub fn parse(raw: &[u8]) -> Result<Self, CoreError> {
        let frame: RawFrame = serde_json::from_slice(raw)
            .map_err(|e| CoreError::Protocol(format!("invalid frame JSON: {}", e)))?;

        if frame.v != PROTOCOL_VERSION {
            return Err(CoreError::Protocol(format!(
                "unsupported protocol version {} (expected {})",
                frame.v, PROTOCOL_VERSION
            )));
        }

        match (frame.id, frame.method, frame.result, frame.error) {
            (Some(id), Some(method), None, None) => Ok(Message::Request {
                id,
                method,
                params: frame.params.unwrap_or(Value::Null),
            }),
            (Some(id), None, Some(result), None) => Ok(Message::Response {
                id,
                result: Ok(result),
            }),
            (Some(id), None, None, Some(error)) => Ok(Message::Response {
                id,
                result: Err(error),
            }),
            (Some(_), None, Some(_), Some(_)) => Err(CoreError::Protocol(
                "response carries both result and error".to_string(),
            )),
            (Some(_), None, None, None) => Err(CoreError::Protocol(
                "response carries neither result nor error".to_string(),
            )),
            (None, Some(method), None, None) => Ok(Message::Notification(Notification {
                method,
                params: frame.params.unwrap_or(Value::Null),
            })),
            _ => Err(CoreError::Protocol(
                "frame is neither request, response, nor notification".to_string(),
            )),
        }
    }

    /// Serializes to a single JSON object (no trailing newline).
    pub fn to_bytes(&self) -> Vec<u8> {
        let frame = match self {
            Message::Request { id, method, params } => RawFrame {
                v: PROTOCOL_VERSION,
                id: Some(*id),
                method: Some(method.clone()),
                params: Some(params.clone()),
                result: None,
                error: None,
            },
            Message::Response { id, result } => match result {
                Ok(value) => RawFrame {
                    v: PROTOCOL_VERSION,
                    id: Some(*id),
                    method: None,
                    params: None,
                    result: Some(value.clone()),
                    error: None,
                },
                Err(error) => RawFrame {
                    v: PROTOCOL_VERSION,
                    id: Some(*id),
                    method: None,
                    params: None,
                    result: None,
                    error: Some(error.clone()),
                },
            },
            Message::Notification(n) => RawFrame {
                v: PROTOCOL_VERSION,
                id: None,
                method: Some(n.method.clone()),
                params: Some(n.params.clone()),
                result: None,
                error: None,
            },
        };

        // RawFrame contains only serializable fields; this cannot fail.
        serde_json::to_vec(&frame).unwrap_or_default()
    }
}
