use crate::error::CoreError;
use crate::protocol::Notification;
use crate::rpc::client::RpcClient;
use crate::rpc::port::{ReplacementRule, WorkerInfo, WorkerPort};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// The single connection slot that survives worker restarts.
///
/// The supervisor installs a fresh `RpcClient` here after each (re)spawn; the
/// session layer holds the link and never sees the swap directly. Each
/// installed client's notifications are forwarded into one stable broadcast
/// channel so subscribers outlive individual worker processes.
pub struct WorkerLink {
    current: RwLock<Option<Arc<RpcClient>>>,
    notify_tx: broadcast::Sender<Notification>,
}

impl WorkerLink {
    pub fn new() -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            current: RwLock::new(None),
            notify_tx,
        })
    }

    /// Installs a freshly connected client and starts forwarding its
    /// notifications. Replaces any previous client.
    pub async fn install(&self, client: Arc<RpcClient>) {
        let mut rx = client.subscribe();
        let forward_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(n) => {
                        let _ = forward_tx.send(n);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.current.write().await = Some(client);
        info!("worker link installed");
    }

    /// Drops the current client; calls fail with Transport until reinstall.
    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    /// Subscribes to the stable notification feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        match self.current.read().await.as_ref() {
            Some(client) => !client.is_closed(),
            None => false,
        }
    }

    async fn client(&self) -> Result<Arc<RpcClient>, CoreError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::Transport("worker not connected".to_string()))
    }
}

#[async_trait]
impl WorkerPort for WorkerLink {
    async fn ping(&self, timeout: std::time::Duration) -> Result<(), CoreError> {
        self.client().await?.ping(timeout).await
    }

    async fn info(&self) -> Result<WorkerInfo, CoreError> {
        self.client().await?.info().await
    }

    async fn load_model(&self, model: &str) -> Result<(), CoreError> {
        self.client().await?.load_model(model).await
    }

    async fn begin_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.client().await?.begin_session(session_id).await
    }

    async fn stop_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.client().await?.stop_session(session_id).await
    }

    async fn cancel_session(&self, session_id: u64) -> Result<(), CoreError> {
        self.client().await?.cancel_session(session_id).await
    }

    async fn push_rules(&self, rules: &[ReplacementRule]) -> Result<(), CoreError> {
        self.client().await?.push_rules(rules).await
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.client().await?.shutdown().await
    }
}
