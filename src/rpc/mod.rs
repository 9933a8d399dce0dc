//! Correlated request/response RPC over the worker's stream pair, plus the
//! uncorrelated notification fan-out.

pub mod client;
pub mod link;
pub mod port;

pub use client::{RpcClient, DEFAULT_CALL_TIMEOUT, LOAD_MODEL_TIMEOUT};
pub use link::WorkerLink;
pub use port::{ReplacementRule, WorkerInfo, WorkerPort};
