use crate::supervisor::{SupervisorConfig, WorkerCommand};
use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub worker: WorkerSettings,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSettings {
    /// Worker binary to spawn
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Model to initialize at startup, if any
    pub model: Option<String>,
}

impl WorkerSettings {
    pub fn command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.program.clone(),
            args: self.args.clone(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
