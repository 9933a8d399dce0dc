//! Worker process supervision
//!
//! Owns the worker lifecycle: spawn, periodic liveness probing, crash
//! detection, bounded-backoff restart, and hard-failure escalation. On every
//! restart the session state machine is notified *before* the new process is
//! connected, so a stale session can never act on a fresh worker.

mod policy;
mod process;

pub use policy::{HealthRecord, HealthSnapshot, RestartPolicy, WorkerPhase};
pub use process::{ProcessLauncher, WorkerCommand, WorkerConnection, WorkerLauncher};

use crate::rpc::{WorkerLink, WorkerPort};
use crate::session::SessionStateMachine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supervision tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Auto-restart stops after this many consecutive failures
    pub max_consecutive_failures: u32,
    /// First restart delay; doubles per consecutive failure
    pub base_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Liveness probe cadence
    pub probe_interval_ms: u64,
    /// Short per-probe deadline
    pub probe_timeout_ms: u64,
    /// Consecutive missed probes counted as a crash
    pub max_probe_misses: u32,
    /// Healthy time required before the failure counter resets
    pub healthy_reset_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 15_000,
            probe_interval_ms: 2_000,
            probe_timeout_ms: 1_500,
            max_probe_misses: 3,
            healthy_reset_secs: 60,
        }
    }
}

impl SupervisorConfig {
    fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// Why a worker connection ended.
enum Outage {
    Crash,
    Manual,
    Shutdown,
}

/// Supervises the single worker process.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    link: Arc<WorkerLink>,
    machine: Arc<SessionStateMachine>,
    config: SupervisorConfig,
    health: Mutex<HealthRecord>,
    shutdown_tx: watch::Sender<bool>,
    restart_requested: Notify,
}

impl WorkerSupervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        link: Arc<WorkerLink>,
        machine: Arc<SessionStateMachine>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            launcher,
            link,
            machine,
            config,
            health: Mutex::new(HealthRecord::new()),
            shutdown_tx,
            restart_requested: Notify::new(),
        })
    }

    /// Health/phase query for the status-indicator collaborator.
    pub async fn health(&self) -> HealthSnapshot {
        self.health.lock().await.snapshot()
    }

    /// Manual restart command. Resets the failure counter and retries
    /// immediately, including from the `Failed` phase.
    pub fn restart(&self) {
        info!("manual worker restart requested");
        self.restart_requested.notify_one();
    }

    /// Begins an orderly shutdown. The run loop never restarts the worker
    /// once this is set.
    pub async fn shutdown(&self) {
        info!("supervisor shutdown requested");
        let _ = self.shutdown_tx.send(true);
        // Polite, best-effort; the run loop kills the child regardless.
        if let Err(e) = self.link.shutdown().await {
            debug!("worker shutdown request not acknowledged: {}", e);
        }
    }

    /// Spawns the supervision loop.
    pub fn spawn_run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let policy = self.config.policy();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.health.lock().await.phase = WorkerPhase::Starting;

            match self.launcher.launch().await {
                Ok(mut conn) => {
                    self.link.install(Arc::clone(&conn.client)).await;

                    let outage = self.watch_worker(&conn, &mut shutdown_rx).await;

                    // Invalidate the session layer before any reconnect:
                    // notify first, then tear down, then respawn.
                    self.link.clear().await;

                    match outage {
                        Outage::Shutdown => {
                            conn.terminate().await;
                            break;
                        }
                        Outage::Manual => {
                            self.machine.worker_restarted().await;
                            conn.terminate().await;
                            self.health.lock().await.record_manual_restart();
                        }
                        Outage::Crash => {
                            self.machine.worker_restarted().await;
                            conn.terminate().await;
                            let failures = {
                                let mut health = self.health.lock().await;
                                health.record_failure();
                                health.record_restarting();
                                health.consecutive_failures
                            };
                            if !self.back_off(&policy, failures, &mut shutdown_rx).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("worker spawn failed: {}", e);
                    let failures = {
                        let mut health = self.health.lock().await;
                        health.record_failure();
                        health.record_restarting();
                        health.consecutive_failures
                    };
                    if !self.back_off(&policy, failures, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        info!("supervisor stopped");
    }

    /// Monitors one live connection until it ends. Returns why.
    async fn watch_worker(
        &self,
        conn: &WorkerConnection,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Outage {
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let healthy_reset = Duration::from_secs(self.config.healthy_reset_secs);

        let mut closed = conn.client.closed();
        let mut probes = tokio::time::interval(Duration::from_millis(self.config.probe_interval_ms));
        probes.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut misses: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Outage::Shutdown;
                    }
                }
                _ = self.restart_requested.notified() => {
                    return Outage::Manual;
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        warn!("worker stream closed unexpectedly");
                        return Outage::Crash;
                    }
                }
                _ = probes.tick() => {
                    match WorkerPort::ping(&*conn.client, probe_timeout).await {
                        Ok(()) => {
                            misses = 0;
                            let newly_ready = {
                                let mut health = self.health.lock().await;
                                let newly_ready = health.phase != WorkerPhase::Ready;
                                health.record_ready(Instant::now());
                                if health.maybe_clear_failures(Instant::now(), healthy_reset) {
                                    info!("worker healthy long enough; failure counter cleared");
                                }
                                newly_ready
                            };
                            if newly_ready {
                                info!("worker ready");
                                self.capture_worker_info(conn).await;
                            }
                        }
                        Err(e) => {
                            misses += 1;
                            warn!(misses, "liveness probe failed: {}", e);
                            self.health.lock().await.record_degraded();
                            if misses >= self.config.max_probe_misses {
                                warn!("probe budget exhausted; treating worker as hung");
                                return Outage::Crash;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn capture_worker_info(&self, conn: &WorkerConnection) {
        match conn.client.info().await {
            Ok(info) => {
                self.health.lock().await.info = Some(info);
            }
            Err(e) => debug!("worker info query failed: {}", e),
        }
    }

    /// Sleeps out the restart backoff, or escalates to `Failed` once the
    /// bound is hit. Returns false when shutdown interrupts.
    async fn back_off(
        &self,
        policy: &RestartPolicy,
        failures: u32,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        if policy.exhausted(failures) {
            error!(
                failures,
                "worker failed too many times; auto-restart stopped, manual restart required"
            );
            self.health.lock().await.phase = WorkerPhase::Failed;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return false;
                        }
                    }
                    _ = self.restart_requested.notified() => {
                        self.health.lock().await.record_manual_restart();
                        return true;
                    }
                }
            }
        }

        let delay = policy.backoff(failures);
        info!(failures, ?delay, "restarting worker after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.restart_requested.notified() => {
                self.health.lock().await.record_manual_restart();
                true
            }
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        }
    }
}
