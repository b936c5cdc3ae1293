//! Events flowing through agent inboxes

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentStatus, EventId};

/// One input or output event of an agent runtime.
///
/// `metadata` carries string annotations such as trace context; it travels
/// with the event but is not part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: EventId,
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            kind: kind.into(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

/// Reply to a synchronous [`call`](crate::agent::RuntimeHandle::call):
/// the status after the step and the step's output events.
#[derive(Debug, Clone)]
pub struct CallReply {
    pub status: AgentStatus,
    pub events: Vec<AgentEvent>,
}
