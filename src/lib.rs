pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod supervisor;

pub use config::Config;
pub use error::CoreError;
pub use protocol::{Message, Notification, MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use rpc::{ReplacementRule, RpcClient, WorkerInfo, WorkerLink, WorkerPort};
pub use session::{
    DictationState, EventPayload, SessionId, SessionOutcome, SessionStateMachine, StateEvent,
};
pub use supervisor::{
    HealthSnapshot, ProcessLauncher, SupervisorConfig, WorkerCommand, WorkerPhase, WorkerSupervisor,
};
