//! Warden Agent Instance Manager
//!
//! A keyed-singleton runtime: opaque keys (session ids, user ids, room
//! names) map to long-lived, stateful agent processes, each running in its
//! own supervised execution context. The manager guarantees exactly one
//! live agent per key, starts agents lazily on first lookup, hibernates
//! and evicts idle agents, thaws prior state from a pluggable store, and
//! tears down crashed agents cleanly.

pub mod agent;
pub mod codec;
pub mod journal;
pub mod manager;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use agent::{
    Agent, AgentRuntime, ChildSpec, Directive, RunExit, RuntimeConfig, RuntimeContext,
    RuntimeHandle, RuntimePersistence, StepOutcome,
};
pub use journal::{DlqEntry, Journal, ThreadCursor};
pub use manager::{
    AgentHandle, GetOptions, InstanceManager, ManagerConfig, ManagerStats, PersistenceConfig,
    SessionEvent,
};
pub use store::{CheckpointKey, FileStore, MemoryStore, Store};
pub use supervisor::{
    ExitReason, MonitorEvent, SessionSupervisor, SupervisorConfig, SupervisorHandle,
    SupervisorParams,
};
pub use types::*;
