//! In-memory store backend
//!
//! Three indexed containers behind one lock: a checkpoint map, an
//! entries-by-`(thread, seq)` ordered map, and a thread-meta map. All
//! operations are atomic by construction; readers share the lock and never
//! block each other. Restart-unsafe; intended for tests and short-lived
//! workloads.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{now_ms, Entry, EntryInput, StoreError, Thread, ThreadMeta};

use super::{CheckpointKey, Store};

#[derive(Default)]
struct MemoryInner {
    checkpoints: HashMap<String, Vec<u8>>,
    entries: BTreeMap<(String, u64), Entry>,
    threads: HashMap<String, ThreadMeta>,
}

impl MemoryInner {
    fn collect_entries(&self, id: &str) -> Vec<Entry> {
        self.entries
            .range((id.to_string(), 0)..=(id.to_string(), u64::MAX))
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

/// Restart-unsafe store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_checkpoint(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().checkpoints.get(&key.storage_id()).cloned())
    }

    async fn put_checkpoint(&self, key: &CheckpointKey, data: &[u8]) -> Result<(), StoreError> {
        self.inner
            .write()
            .checkpoints
            .insert(key.storage_id(), data.to_vec());
        Ok(())
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        self.inner.write().checkpoints.remove(&key.storage_id());
        Ok(())
    }

    async fn load_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        let inner = self.inner.read();
        let meta = match inner.threads.get(id) {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };
        let entries = inner.collect_entries(id);
        Ok(Some(meta.into_thread(id, entries)))
    }

    async fn append_thread(
        &self,
        id: &str,
        entries: Vec<EntryInput>,
        expected_rev: Option<u64>,
    ) -> Result<Thread, StoreError> {
        let mut inner = self.inner.write();
        let now = now_ms();
        let mut meta = inner
            .threads
            .get(id)
            .cloned()
            .unwrap_or_else(|| ThreadMeta::new(now));

        if let Some(expected) = expected_rev {
            if meta.rev != expected {
                return Err(StoreError::Conflict {
                    thread_id: id.to_string(),
                    expected,
                    actual: meta.rev,
                });
            }
        }

        for input in entries {
            let entry = input.into_entry(meta.rev);
            inner.entries.insert((id.to_string(), entry.seq), entry);
            meta.rev += 1;
        }
        meta.updated_at = now;
        inner.threads.insert(id.to_string(), meta.clone());

        let all = inner.collect_entries(id);
        Ok(meta.into_thread(id, all))
    }

    async fn delete_thread(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.threads.remove(id);
        let keys: Vec<(String, u64)> = inner
            .entries
            .range((id.to_string(), 0)..=(id.to_string(), u64::MAX))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            inner.entries.remove(&key);
        }
        Ok(())
    }
}
