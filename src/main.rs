use anyhow::Result;
use clap::Parser;
use scribe_core::{
    Config, ProcessLauncher, SessionStateMachine, WorkerLink, WorkerSupervisor,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scribe-core", about = "Dictation worker orchestration core")]
struct Cli {
    /// Config file (without extension, per the config crate)
    #[arg(short, long, default_value = "config/scribe-core")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("scribe-core v0.1.0");
    info!("worker: {} {:?}", cfg.worker.program, cfg.worker.args);

    let link = WorkerLink::new();
    let machine = SessionStateMachine::new(link.clone());
    machine.clone().spawn_notification_pump(link.subscribe());

    let launcher = Arc::new(ProcessLauncher::new(cfg.worker.command()));
    let supervisor = WorkerSupervisor::new(launcher, link.clone(), machine.clone(), cfg.supervisor);
    supervisor.clone().spawn_run();

    // Log the event feed so a headless run is observable.
    let mut events = machine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(seq = event.seq, session = ?event.session, "state: {:?}", event.state);
        }
    });

    if let Some(model) = cfg.worker.model.as_deref() {
        // Give the supervisor a moment to bring the first worker up.
        for _ in 0..100 {
            if link.is_connected().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if let Err(e) = machine.load_model(model).await {
            warn!("initial model load failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    supervisor.shutdown().await;

    Ok(())
}
