//! Core types and data structures for the instance manager

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod agent;
pub mod error;
pub mod event;
pub mod thread;

pub use agent::*;
pub use error::*;
pub use event::*;
pub use thread::*;

/// Opaque key identifying one logical agent (session id, user id, room name).
///
/// Keys are caller-supplied and only compared for equality; the manager
/// never interprets their contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentKey(String);

impl AgentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for AgentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for supervisor monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorId(pub Uuid);

impl MonitorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MonitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_key_equality() {
        assert_eq!(AgentKey::from("u1"), AgentKey::new("u1"));
        assert_ne!(AgentKey::from("u1"), AgentKey::from("u2"));
        assert_eq!(AgentKey::from("room:7").to_string(), "room:7");
    }

    #[test]
    fn monitor_ids_are_unique() {
        assert_ne!(MonitorId::new(), MonitorId::new());
    }
}
