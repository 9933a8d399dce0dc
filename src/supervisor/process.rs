use crate::error::CoreError;
use crate::rpc::RpcClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How the worker process is launched.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A live connection to one worker process instance.
///
/// `child` is `None` for test doubles wired over in-memory pipes.
pub struct WorkerConnection {
    pub client: Arc<RpcClient>,
    child: Option<Child>,
}

impl WorkerConnection {
    pub fn new(client: Arc<RpcClient>, child: Option<Child>) -> Self {
        Self { client, child }
    }

    /// Kills the underlying process, if there is one.
    pub async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("worker kill failed (already exited?): {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

/// Seam between the supervisor and process creation, so supervision logic can
/// be exercised against scripted in-memory workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerConnection, CoreError>;
}

/// Launches the real worker binary with piped stdio.
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerConnection, CoreError> {
        info!(program = %self.command.program, "spawning worker process");

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(program = %self.command.program, "spawn failed: {}", e);
                CoreError::Transport(format!("failed to spawn worker: {}", e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Transport("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Transport("worker stdout not piped".to_string()))?;

        let client = RpcClient::new(stdout, stdin);
        Ok(WorkerConnection::new(client, Some(child)))
    }
}
