//! File-backed store
//!
//! Directory layout under the configured root:
//!
//! ```text
//! checkpoints/{sha256-url-safe-base64-of-key}.bin
//! threads/{thread_id}/meta.bin       JSON thread bookkeeping
//! threads/{thread_id}/entries.log    length-prefixed entry frames
//! ```
//!
//! Checkpoint, meta, and entry-log writes all go through a `.tmp` sibling
//! followed by a rename, so a crash mid-write leaves the prior committed
//! state intact; the revision recorded in `meta.bin` bounds what counts as
//! committed in `entries.log`. Appends to one thread are serialized with a
//! named async mutex keyed on the thread id; rename atomicity is the OS's
//! job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::codec;
use crate::types::{now_ms, Entry, EntryInput, StoreError, Thread, ThreadMeta};

use super::{CheckpointKey, Store};

const CHECKPOINT_DIR: &str = "checkpoints";
const THREAD_DIR: &str = "threads";
const META_FILE: &str = "meta.bin";
const ENTRIES_FILE: &str = "entries.log";

/// Durable single-node store rooted at a base directory.
pub struct FileStore {
    root: PathBuf,
    thread_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FileStore {
    /// Open (creating if necessary) a store under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(CHECKPOINT_DIR))?;
        std::fs::create_dir_all(root.join(THREAD_DIR))?;
        Ok(Self {
            root,
            thread_locks: DashMap::new(),
        })
    }

    fn checkpoint_path(&self, key: &CheckpointKey) -> PathBuf {
        self.root
            .join(CHECKPOINT_DIR)
            .join(format!("{}.bin", key.storage_id()))
    }

    fn thread_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        // Thread ids become directory names; refuse anything that could
        // escape the store root.
        if id.is_empty()
            || id == "."
            || id == ".."
            || id.contains('/')
            || id.contains('\\')
            || id.contains('\u{0}')
        {
            return Err(StoreError::InvalidData(format!(
                "thread id {:?} is not filesystem-safe",
                id
            )));
        }
        Ok(self.root.join(THREAD_DIR).join(id))
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.thread_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_meta(&self, dir: &Path) -> Result<Option<ThreadMeta>, StoreError> {
        let bytes = match fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::InvalidData(format!("malformed thread meta: {}", e)))
    }

    async fn read_entries(&self, dir: &Path, rev: u64) -> Result<Vec<Entry>, StoreError> {
        let bytes = match fs::read(dir.join(ENTRIES_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        // A crashed append can leave a partial trailing frame; only
        // complete frames count.
        let (mut entries, consumed) = codec::decode_entry_frames_prefix(&bytes)?;
        if consumed < bytes.len() {
            tracing::debug!(
                "Ignoring {} bytes of torn tail in {}",
                bytes.len() - consumed,
                dir.display()
            );
        }
        if (entries.len() as u64) < rev {
            return Err(StoreError::InvalidData(format!(
                "entry log holds {} complete entries but meta claims rev {}",
                entries.len(),
                rev
            )));
        }
        // Complete frames beyond rev are a torn append that never committed
        // its meta update; the recorded revision is authoritative.
        entries.truncate(rev as usize);
        Ok(entries)
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_checkpoint(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.checkpoint_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_checkpoint(&self, key: &CheckpointKey, data: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(&self.checkpoint_path(key), data).await
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        match fs::remove_file(self.checkpoint_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        let dir = self.thread_dir(id)?;
        let meta = match self.read_meta(&dir).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let entries = self.read_entries(&dir, meta.rev).await?;
        Ok(Some(meta.into_thread(id, entries)))
    }

    async fn append_thread(
        &self,
        id: &str,
        entries: Vec<EntryInput>,
        expected_rev: Option<u64>,
    ) -> Result<Thread, StoreError> {
        let dir = self.thread_dir(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let mut meta = match self.read_meta(&dir).await? {
            Some(meta) => meta,
            None => {
                fs::create_dir_all(&dir).await?;
                ThreadMeta::new(now)
            }
        };

        if let Some(expected) = expected_rev {
            if meta.rev != expected {
                return Err(StoreError::Conflict {
                    thread_id: id.to_string(),
                    expected,
                    actual: meta.rev,
                });
            }
        }

        let mut all = self.read_entries(&dir, meta.rev).await?;
        let mut frames = Vec::new();
        for entry in &all {
            frames.extend(codec::encode_entry_frame(entry)?);
        }
        for input in entries {
            let entry = input.into_entry(meta.rev);
            frames.extend(codec::encode_entry_frame(&entry)?);
            all.push(entry);
            meta.rev += 1;
        }

        // Rewrite the whole log through tmp + rename: ghost frames or a
        // partial tail left by a torn append must not survive ahead of the
        // new entries. The log lands before the meta update, so a crash in
        // between leaves the new frames uncommitted, not corrupt.
        self.write_atomic(&dir.join(ENTRIES_FILE), &frames).await?;

        meta.updated_at = now;
        self.write_atomic(&dir.join(META_FILE), &serde_json::to_vec(&meta)?)
            .await?;

        Ok(meta.into_thread(id, all))
    }

    async fn delete_thread(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.thread_dir(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        drop(_guard);
        self.thread_locks.remove(id);
        Ok(())
    }
}
