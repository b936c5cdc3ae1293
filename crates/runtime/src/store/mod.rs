//! Pluggable persistence for checkpoints and thread journals
//!
//! Two backends ship with the crate: [`MemoryStore`] for tests and
//! short-lived workloads, and [`FileStore`] for durable single-node
//! deployments. Both satisfy the same contract and the same conformance
//! test suite: checkpoint writes are atomic, thread appends are serialized
//! per thread and guarded by optimistic revision checks, and missing
//! resources are reported as `Ok(None)` rather than errors.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::types::{EntryInput, StoreError, Thread};

pub mod file;
pub mod memory;

#[cfg(test)]
pub(crate) mod conformance;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Logical address of one checkpoint: the agent module name plus the
/// caller-supplied key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub agent: String,
    pub key: String,
}

impl CheckpointKey {
    pub fn new(agent: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            key: key.into(),
        }
    }

    /// Stable storage identifier: URL-safe base64 (no padding) of the
    /// SHA-256 of the canonical JSON `[agent, key]` pair. Only the hash
    /// ever reaches a filesystem path, so hostile keys cannot traverse
    /// directories.
    pub fn storage_id(&self) -> String {
        let canonical = serde_json::to_vec(&(&self.agent, &self.key))
            .unwrap_or_else(|_| format!("{}\u{0}{}", self.agent, self.key).into_bytes());
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent, self.key)
    }
}

/// Persistence contract every backend implements.
#[async_trait]
pub trait Store: Send + Sync {
    /// Deterministic checkpoint lookup; absence is `Ok(None)`, never an error.
    async fn get_checkpoint(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomic checkpoint write: on failure the prior value (or absence)
    /// must be intact.
    async fn put_checkpoint(&self, key: &CheckpointKey, data: &[u8]) -> Result<(), StoreError>;

    /// Idempotent checkpoint delete; absence is success.
    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<(), StoreError>;

    /// Load a thread with all of its entries.
    async fn load_thread(&self, id: &str) -> Result<Option<Thread>, StoreError>;

    /// Atomically append entries, assigning `seq` and missing `id`/`at`
    /// fields. With `expected_rev` set, fails with
    /// [`StoreError::Conflict`] unless the current revision matches.
    /// Appends to the same thread are serialized across concurrent callers.
    async fn append_thread(
        &self,
        id: &str,
        entries: Vec<EntryInput>,
        expected_rev: Option<u64>,
    ) -> Result<Thread, StoreError>;

    /// Idempotent thread delete.
    async fn delete_thread(&self, id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_id_is_stable_and_distinct() {
        let a = CheckpointKey::new("Agent", "u1");
        let b = CheckpointKey::new("Agent", "u1");
        let c = CheckpointKey::new("Agent", "u2");
        let d = CheckpointKey::new("Other", "u1");

        assert_eq!(a.storage_id(), b.storage_id());
        assert_ne!(a.storage_id(), c.storage_id());
        assert_ne!(a.storage_id(), d.storage_id());
    }

    #[test]
    fn storage_id_is_path_safe() {
        let key = CheckpointKey::new("Agent", "../../etc/passwd");
        let id = key.storage_id();
        assert!(!id.contains('/'));
        assert!(!id.contains('.'));
        assert!(!id.contains('='));
        // SHA-256 is 32 bytes; unpadded base64 of that is 43 chars.
        assert_eq!(id.len(), 43);
    }
}
