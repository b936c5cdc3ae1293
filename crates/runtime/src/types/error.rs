//! Error types for the instance manager

use thiserror::Error;

use super::{AgentKey, AgentStatus};

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("revision conflict on thread {thread_id}: expected {expected}, actual {actual}")]
    Conflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },
}

/// Journal layer errors
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("revision conflict on thread {thread_id}: expected {expected}, actual {actual}")]
    Conflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from a single agent runtime
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: AgentStatus, to: AgentStatus },

    #[error("agent init failed: {0}")]
    Init(String),

    #[error("step failed: {0}")]
    Step(String),

    #[error("step panicked: {0}")]
    StepPanic(String),

    #[error("operation timed out")]
    Timeout,

    #[error("runtime not found or no longer running")]
    NotFound,

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Supervision tree errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("child not found: {0}")]
    ChildNotFound(String),

    #[error("supervisor already exited")]
    Exited,
}

/// Errors surfaced by the instance manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("no agent registered under key {0}")]
    NotFound(AgentKey),

    #[error("operation timed out")]
    Timeout,

    #[error("supervisor for key {key} exceeded its restart budget")]
    MaxRestartsExceeded { key: AgentKey },

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_useful_messages() {
        let err = AgentError::IllegalTransition {
            from: AgentStatus::Idle,
            to: AgentStatus::Completed,
        };
        assert_eq!(err.to_string(), "illegal status transition: idle -> completed");

        let err = ManagerError::NotFound(AgentKey::from("u1"));
        assert!(err.to_string().contains("u1"));
    }

    #[test]
    fn conversions_compose() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let store: StoreError = io.into();
        let top: RuntimeError = store.into();
        assert!(matches!(top, RuntimeError::Store(StoreError::Io(_))));
    }
}
