//! Agent state and the status state machine

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of an agent, stored inside its durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Completed,
    Failed,
    Terminating,
    Terminated,
}

impl AgentStatus {
    /// Completed and Failed are the "settled" statuses awaiters wait for.
    pub fn is_settled(self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Terminating | AgentStatus::Terminated)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Terminating => "terminating",
            AgentStatus::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Validates status transitions.
///
/// Staying in the same status is always permitted; it is not a transition.
pub struct StatusMachine {
    valid_transitions: HashMap<AgentStatus, Vec<AgentStatus>>,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            AgentStatus::Idle,
            vec![AgentStatus::Working, AgentStatus::Terminating],
        );
        valid_transitions.insert(
            AgentStatus::Working,
            vec![
                AgentStatus::Completed,
                AgentStatus::Failed,
                AgentStatus::Idle,
                AgentStatus::Terminating,
            ],
        );
        valid_transitions.insert(
            AgentStatus::Completed,
            vec![AgentStatus::Idle, AgentStatus::Terminating],
        );
        valid_transitions.insert(
            AgentStatus::Failed,
            vec![AgentStatus::Idle, AgentStatus::Terminating],
        );
        valid_transitions.insert(AgentStatus::Terminating, vec![AgentStatus::Terminated]);
        valid_transitions.insert(AgentStatus::Terminated, vec![]); // Absorbing state

        Self { valid_transitions }
    }

    pub fn is_valid_transition(&self, from: AgentStatus, to: AgentStatus) -> bool {
        if from == to {
            return true;
        }
        self.valid_transitions
            .get(&from)
            .map(|transitions| transitions.contains(&to))
            .unwrap_or(false)
    }
}

/// Durable payload of one agent.
///
/// The framework interprets only `status` and `error`; `fields` is the
/// user-defined portion, carried as a JSON object so checkpoints round-trip
/// losslessly and unknown fields written by newer code are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            error: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Merge a set of fields into the state, overwriting existing keys.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (name, value) in fields {
            self.fields.insert(name, value);
        }
    }

    /// Remove a field by dotted path (`"a.b.c"` removes `c` inside `a.b`).
    ///
    /// Returns true if something was removed.
    pub fn remove_path(&mut self, path: &str) -> bool {
        let mut parts = path.split('.').collect::<Vec<_>>();
        let leaf = match parts.pop() {
            Some(leaf) => leaf,
            None => return false,
        };
        if parts.is_empty() {
            return self.fields.remove(leaf).is_some();
        }
        let mut current = match self.fields.get_mut(parts[0]) {
            Some(value) => value,
            None => return false,
        };
        for part in &parts[1..] {
            current = match current.get_mut(*part) {
                Some(value) => value,
                None => return false,
            };
        }
        match current.as_object_mut() {
            Some(object) => object.remove(leaf).is_some(),
            None => false,
        }
    }
}

/// Why a runtime is being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Orderly stop requested by the owner.
    Normal,
    /// Manager or supervisor shutdown.
    Shutdown,
    /// The step hook faulted too many times in a row.
    RepeatedFailure,
    /// Forceful termination.
    Killed,
    /// Application-specific reason supplied by a directive.
    Other(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Normal => write!(f, "normal"),
            StopReason::Shutdown => write!(f, "shutdown"),
            StopReason::RepeatedFailure => write!(f, "repeated_failure"),
            StopReason::Killed => write!(f, "killed"),
            StopReason::Other(reason) => write!(f, "{}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legal_transitions() {
        let machine = StatusMachine::new();

        assert!(machine.is_valid_transition(AgentStatus::Idle, AgentStatus::Working));
        assert!(machine.is_valid_transition(AgentStatus::Working, AgentStatus::Completed));
        assert!(machine.is_valid_transition(AgentStatus::Working, AgentStatus::Failed));
        assert!(machine.is_valid_transition(AgentStatus::Working, AgentStatus::Idle));
        assert!(machine.is_valid_transition(AgentStatus::Completed, AgentStatus::Idle));
        assert!(machine.is_valid_transition(AgentStatus::Failed, AgentStatus::Terminating));
        assert!(machine.is_valid_transition(AgentStatus::Terminating, AgentStatus::Terminated));
    }

    #[test]
    fn illegal_transitions() {
        let machine = StatusMachine::new();

        assert!(!machine.is_valid_transition(AgentStatus::Idle, AgentStatus::Completed));
        assert!(!machine.is_valid_transition(AgentStatus::Idle, AgentStatus::Terminated));
        assert!(!machine.is_valid_transition(AgentStatus::Completed, AgentStatus::Working));
        assert!(!machine.is_valid_transition(AgentStatus::Terminated, AgentStatus::Idle));
        assert!(!machine.is_valid_transition(AgentStatus::Terminated, AgentStatus::Working));
    }

    #[test]
    fn same_status_is_always_allowed() {
        let machine = StatusMachine::new();
        for status in [
            AgentStatus::Idle,
            AgentStatus::Working,
            AgentStatus::Terminated,
        ] {
            assert!(machine.is_valid_transition(status, status));
        }
    }

    #[test]
    fn state_serde_roundtrip() {
        let state = AgentState::new()
            .with_field("counter", json!(7))
            .with_field("nested", json!({"a": [1, 2, 3], "b": null}));

        let bytes = serde_json::to_vec(&state).unwrap();
        let decoded: AgentState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.status, AgentStatus::Idle);
    }

    #[test]
    fn remove_path_handles_nesting() {
        let mut state = AgentState::new()
            .with_field("top", json!(1))
            .with_field("nested", json!({"inner": {"leaf": true}, "keep": 2}));

        assert!(state.remove_path("nested.inner.leaf"));
        assert!(!state.remove_path("nested.inner.leaf"));
        assert!(state.remove_path("top"));
        assert_eq!(state.get("nested").unwrap()["keep"], json!(2));
        assert!(!state.remove_path("missing.path"));
    }
}
