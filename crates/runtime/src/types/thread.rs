//! Threads and their append-only entries

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::now_ms;

/// One immutable record in a thread.
///
/// Once appended, an entry is never rewritten; `seq` equals its zero-based
/// index in the thread and `at` is the append timestamp in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub seq: u64,
    pub at: i64,
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub refs: HashMap<String, String>,
}

/// Input to an append: `id` and `at` are filled in by the journal when
/// absent, and `seq` is always assigned by the journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub refs: HashMap<String, String>,
}

impl EntryInput {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            at: None,
            kind: kind.into(),
            payload,
            refs: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_ref(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.refs.insert(name.into(), target.into());
        self
    }

    /// Seal the input into an entry at the given sequence number.
    pub fn into_entry(self, seq: u64) -> Entry {
        Entry {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            seq,
            at: self.at.unwrap_or_else(now_ms),
            kind: self.kind,
            payload: self.payload,
            refs: self.refs,
        }
    }
}

/// An ordered, append-only sequence of entries.
///
/// Invariant: `rev == entries.len()` and `entries[i].seq == i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub rev: u64,
    pub entries: Vec<Entry>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Thread bookkeeping persisted separately from the entry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub rev: u64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ThreadMeta {
    pub fn new(now: i64) -> Self {
        Self {
            rev: 0,
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
        }
    }

    pub fn into_thread(self, id: impl Into<String>, entries: Vec<Entry>) -> Thread {
        Thread {
            id: id.into(),
            rev: self.rev,
            entries,
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_defaults_are_filled() {
        let entry = EntryInput::new("note", json!({"text": "hi"})).into_entry(3);
        assert_eq!(entry.seq, 3);
        assert!(!entry.id.is_empty());
        assert!(entry.at > 0);
    }

    #[test]
    fn input_preserves_explicit_id() {
        let entry = EntryInput::new("note", json!({}))
            .with_id("e-1")
            .with_ref("parent", "e-0")
            .into_entry(0);
        assert_eq!(entry.id, "e-1");
        assert_eq!(entry.refs["parent"], "e-0");
    }

    #[test]
    fn meta_into_thread_keeps_counts() {
        let mut meta = ThreadMeta::new(1_000);
        meta.rev = 2;
        let entries = vec![
            EntryInput::new("a", json!(1)).into_entry(0),
            EntryInput::new("b", json!(2)).into_entry(1),
        ];
        let thread = meta.into_thread("t1", entries);
        assert_eq!(thread.rev, 2);
        assert_eq!(thread.entries.len(), 2);
        assert_eq!(thread.entries[1].seq, 1);
    }
}
