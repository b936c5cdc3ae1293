//! Journal service: optimistic-concurrency appends, subscription cursors,
//! and a dead-letter queue
//!
//! A thin layer over the [`Store`]: appends carry an expected revision so
//! concurrent writers detect each other, per-subscription cursors record
//! the last-delivered sequence number, and entries that could not be
//! processed land in a bounded in-memory dead-letter queue keyed by
//! `(subscription_id, entry_id)`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::{CheckpointKey, Store};
use crate::types::{now_ms, Entry, EntryInput, JournalError, StoreError, Thread};

/// Reserved agent namespace for persisted subscription cursors.
const CURSOR_NAMESPACE: &str = "journal.cursor";

/// Default upper bound on retained dead letters per subscription.
const DEFAULT_DLQ_CAPACITY: usize = 1000;

/// Last-delivered position of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCursor {
    pub thread_id: String,
    pub seq: u64,
}

/// One parked entry plus why it is parked.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqEntry {
    pub entry: Entry,
    pub reason: String,
    pub at: i64,
}

/// Journal over a pluggable store.
pub struct Journal {
    store: Arc<dyn Store>,
    dlq: Mutex<HashMap<String, Vec<DlqEntry>>>,
    dlq_capacity: usize,
}

impl Journal {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            dlq: Mutex::new(HashMap::new()),
            dlq_capacity: DEFAULT_DLQ_CAPACITY,
        }
    }

    pub fn with_dlq_capacity(mut self, capacity: usize) -> Self {
        self.dlq_capacity = capacity.max(1);
        self
    }

    /// Append entries to a thread, optionally guarded by an expected
    /// revision. Conflicts surface as [`JournalError::Conflict`] so the
    /// caller can reload and retry.
    pub async fn append(
        &self,
        thread_id: &str,
        entries: Vec<EntryInput>,
        expected_rev: Option<u64>,
    ) -> Result<Thread, JournalError> {
        match self.store.append_thread(thread_id, entries, expected_rev).await {
            Ok(thread) => Ok(thread),
            Err(StoreError::Conflict {
                thread_id,
                expected,
                actual,
            }) => Err(JournalError::Conflict {
                thread_id,
                expected,
                actual,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, thread_id: &str) -> Result<Option<Thread>, JournalError> {
        Ok(self.store.load_thread(thread_id).await?)
    }

    pub async fn delete(&self, thread_id: &str) -> Result<(), JournalError> {
        Ok(self.store.delete_thread(thread_id).await?)
    }

    // ── Subscription cursors ──────────────────────────────────────────

    /// Record the last-delivered position for a subscription. Persisted
    /// through the store, so cursors survive restarts when the store does.
    pub async fn record_cursor(
        &self,
        subscription_id: &str,
        cursor: &ThreadCursor,
    ) -> Result<(), JournalError> {
        let key = Self::cursor_key(subscription_id);
        let bytes = serde_json::to_vec(cursor).map_err(StoreError::from)?;
        Ok(self.store.put_checkpoint(&key, &bytes).await?)
    }

    pub async fn read_cursor(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ThreadCursor>, JournalError> {
        let key = Self::cursor_key(subscription_id);
        let bytes = match self.store.get_checkpoint(&key).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let cursor = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::InvalidData(format!("malformed cursor: {}", e)))?;
        Ok(Some(cursor))
    }

    pub async fn delete_cursor(&self, subscription_id: &str) -> Result<(), JournalError> {
        let key = Self::cursor_key(subscription_id);
        Ok(self.store.delete_checkpoint(&key).await?)
    }

    fn cursor_key(subscription_id: &str) -> CheckpointKey {
        CheckpointKey::new(CURSOR_NAMESPACE, subscription_id)
    }

    // ── Dead-letter queue ─────────────────────────────────────────────

    /// Park an entry for a subscription. Re-parking the same entry id
    /// replaces the earlier record in place; when the queue is full the
    /// oldest letter is dropped.
    pub fn dlq_put(&self, subscription_id: &str, entry: Entry, reason: impl Into<String>) {
        let mut dlq = self.dlq.lock();
        let letters = dlq.entry(subscription_id.to_string()).or_default();
        let record = DlqEntry {
            entry,
            reason: reason.into(),
            at: now_ms(),
        };
        if let Some(existing) = letters
            .iter_mut()
            .find(|letter| letter.entry.id == record.entry.id)
        {
            *existing = record;
            return;
        }
        if letters.len() >= self.dlq_capacity {
            let dropped = letters.remove(0);
            tracing::warn!(
                "DLQ for subscription {} full, dropping oldest entry {}",
                subscription_id,
                dropped.entry.id
            );
        }
        letters.push(record);
    }

    /// Parked entries for a subscription, in insertion-time order.
    pub fn dlq_list(&self, subscription_id: &str) -> Vec<DlqEntry> {
        self.dlq
            .lock()
            .get(subscription_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove one parked entry; returns whether it existed.
    pub fn dlq_delete(&self, subscription_id: &str, entry_id: &str) -> bool {
        let mut dlq = self.dlq.lock();
        if let Some(letters) = dlq.get_mut(subscription_id) {
            let before = letters.len();
            letters.retain(|letter| letter.entry.id != entry_id);
            if letters.is_empty() {
                dlq.remove(subscription_id);
            }
            return before
                > dlq
                    .get(subscription_id)
                    .map(|letters| letters.len())
                    .unwrap_or(0);
        }
        false
    }

    pub fn dlq_clear(&self, subscription_id: &str) {
        self.dlq.lock().remove(subscription_id);
    }
}
