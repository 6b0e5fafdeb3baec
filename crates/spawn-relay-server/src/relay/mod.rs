//! Daemon relay: connection registry, RPC correlation, spawn orchestration.

pub mod registry;
pub mod rpc;
pub mod spawn;

pub use registry::{ConnectionKind, ConnectionRecord, ConnectionRegistry};
pub use spawn::SpawnOrchestrator;
