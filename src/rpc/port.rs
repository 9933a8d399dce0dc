use crate::error::CoreError;
use crate::protocol::methods;
use crate::rpc::client::{RpcClient, DEFAULT_CALL_TIMEOUT, LOAD_MODEL_TIMEOUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Capability/info report from the worker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerInfo {
    pub name: String,
    pub version: String,
    /// Loaded model identifier, if any
    pub model: Option<String>,
    /// Compute device in use (e.g., "cpu", "metal")
    pub device: Option<String>,
}

/// A text replacement rule applied by the worker at transcription time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplacementRule {
    pub pattern: String,
    pub replacement: String,
}

/// The typed method surface the session layer uses to drive the worker.
///
/// Implemented by `RpcClient` for a live process and by `WorkerLink` for the
/// restart-surviving slot; tests substitute scripted fakes.
#[async_trait]
pub trait WorkerPort: Send + Sync {
    /// Liveness probe under a caller-chosen short timeout.
    async fn ping(&self, timeout: std::time::Duration) -> Result<(), CoreError>;

    async fn info(&self) -> Result<WorkerInfo, CoreError>;

    /// One-time heavy operation; carries the long timeout class.
    async fn load_model(&self, model: &str) -> Result<(), CoreError>;

    async fn begin_session(&self, session_id: u64) -> Result<(), CoreError>;

    /// Fast synchronous stop handshake. Transcription continues afterward,
    /// asynchronously, reported via notifications.
    async fn stop_session(&self, session_id: u64) -> Result<(), CoreError>;

    async fn cancel_session(&self, session_id: u64) -> Result<(), CoreError>;

    async fn push_rules(&self, rules: &[ReplacementRule]) -> Result<(), CoreError>;

    /// Polite shutdown request; best-effort.
    async fn shutdown(&self) -> Result<(), CoreError>;
}

#[async_trait]
impl WorkerPort for RpcClient {
    async fn ping(&self, timeout: std::time::Duration) -> Result<(), CoreError> {
        self.call(methods::PING, json!({}), timeout).await.map(|_| ())
    }

    async fn info(&self) -> Result<WorkerInfo, CoreError> {
        let value = self.call_default(methods::INFO, json!({})).await?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::Protocol(format!("invalid worker.info result: {}", e)))
    }

    async fn load_model(&self, model: &str) -> Result<(), CoreError> {
        self.call(methods::LOAD_MODEL, json!({ "model": model }), LOAD_MODEL_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn begin_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.call_default(methods::SESSION_BEGIN, json!({ "session_id": session_id }))
            .await
            .map(|_| ())
    }

    async fn stop_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.call_default(methods::SESSION_STOP, json!({ "session_id": session_id }))
            .await
            .map(|_| ())
    }

    async fn cancel_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.call_default(methods::SESSION_CANCEL, json!({ "session_id": session_id }))
            .await
            .map(|_| ())
    }

    async fn push_rules(&self, rules: &[ReplacementRule]) -> Result<(), CoreError> {
        self.call_default(methods::RULES_PUSH, json!({ "rules": rules }))
            .await
            .map(|_| ())
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.call(methods::SHUTDOWN, json!({}), DEFAULT_CALL_TIMEOUT)
            .await
            .map(|_| ())
    }
}
