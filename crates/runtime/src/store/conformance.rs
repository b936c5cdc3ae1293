//! Shared conformance suite run against every store backend.
//!
//! Each check uses its own checkpoint keys and thread ids, so the whole
//! suite can run against a single store instance.

use serde_json::json;

use crate::types::{EntryInput, StoreError};

use super::{CheckpointKey, Store};

pub(crate) async fn run_all<S: Store>(store: &S) {
    checkpoint_roundtrip(store).await;
    checkpoint_overwrite(store).await;
    missing_checkpoint_is_none(store).await;
    delete_checkpoint_is_idempotent(store).await;
    append_assigns_seq_and_defaults(store).await;
    append_enforces_expected_rev(store).await;
    append_without_expected_rev_always_wins(store).await;
    load_missing_thread_is_none(store).await;
    delete_thread_is_idempotent(store).await;
    thread_invariants_hold(store).await;
}

async fn checkpoint_roundtrip<S: Store>(store: &S) {
    let key = CheckpointKey::new("Conformance", "roundtrip");
    store.put_checkpoint(&key, b"payload-1").await.unwrap();
    let loaded = store.get_checkpoint(&key).await.unwrap();
    assert_eq!(loaded.as_deref(), Some(&b"payload-1"[..]));
}

async fn checkpoint_overwrite<S: Store>(store: &S) {
    let key = CheckpointKey::new("Conformance", "overwrite");
    store.put_checkpoint(&key, b"old").await.unwrap();
    store.put_checkpoint(&key, b"new").await.unwrap();
    let loaded = store.get_checkpoint(&key).await.unwrap();
    assert_eq!(loaded.as_deref(), Some(&b"new"[..]));
}

async fn missing_checkpoint_is_none<S: Store>(store: &S) {
    let key = CheckpointKey::new("Conformance", "never-written");
    assert!(store.get_checkpoint(&key).await.unwrap().is_none());
}

async fn delete_checkpoint_is_idempotent<S: Store>(store: &S) {
    let key = CheckpointKey::new("Conformance", "delete-me");
    store.put_checkpoint(&key, b"x").await.unwrap();
    store.delete_checkpoint(&key).await.unwrap();
    assert!(store.get_checkpoint(&key).await.unwrap().is_none());
    // Second delete of an absent checkpoint is still success.
    store.delete_checkpoint(&key).await.unwrap();
}

async fn append_assigns_seq_and_defaults<S: Store>(store: &S) {
    let thread = store
        .append_thread(
            "conf-assign",
            vec![
                EntryInput::new("note", json!({"text": "first"})),
                EntryInput::new("note", json!({"text": "second"})).with_id("explicit-id"),
            ],
            None,
        )
        .await
        .unwrap();

    assert_eq!(thread.rev, 2);
    assert_eq!(thread.entries[0].seq, 0);
    assert_eq!(thread.entries[1].seq, 1);
    assert!(!thread.entries[0].id.is_empty());
    assert_eq!(thread.entries[1].id, "explicit-id");
    assert!(thread.entries[0].at > 0);
}

async fn append_enforces_expected_rev<S: Store>(store: &S) {
    let id = "conf-occ";
    let thread = store
        .append_thread(id, vec![EntryInput::new("e1", json!(1))], None)
        .await
        .unwrap();
    assert_eq!(thread.rev, 1);

    let err = store
        .append_thread(id, vec![EntryInput::new("e2", json!(2))], Some(0))
        .await
        .unwrap_err();
    match err {
        StoreError::Conflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    let thread = store
        .append_thread(id, vec![EntryInput::new("e2", json!(2))], Some(1))
        .await
        .unwrap();
    assert_eq!(thread.rev, 2);

    // A conflicting append must not have left partial entries behind.
    let loaded = store.load_thread(id).await.unwrap().unwrap();
    assert_eq!(loaded.entries.len(), 2);
    assert_eq!(loaded.entries[0].kind, "e1");
    assert_eq!(loaded.entries[1].kind, "e2");
}

async fn append_without_expected_rev_always_wins<S: Store>(store: &S) {
    let id = "conf-no-occ";
    for i in 0..3 {
        store
            .append_thread(id, vec![EntryInput::new("tick", json!(i))], None)
            .await
            .unwrap();
    }
    let thread = store.load_thread(id).await.unwrap().unwrap();
    assert_eq!(thread.rev, 3);
}

async fn load_missing_thread_is_none<S: Store>(store: &S) {
    assert!(store.load_thread("conf-nothing-here").await.unwrap().is_none());
}

async fn delete_thread_is_idempotent<S: Store>(store: &S) {
    let id = "conf-del";
    store
        .append_thread(id, vec![EntryInput::new("x", json!(null))], None)
        .await
        .unwrap();
    store.delete_thread(id).await.unwrap();
    assert!(store.load_thread(id).await.unwrap().is_none());
    store.delete_thread(id).await.unwrap();
    // Deleting resets the revision: a fresh append starts at zero again.
    let thread = store
        .append_thread(id, vec![EntryInput::new("y", json!(null))], Some(0))
        .await
        .unwrap();
    assert_eq!(thread.rev, 1);
    assert_eq!(thread.entries[0].seq, 0);
}

async fn thread_invariants_hold<S: Store>(store: &S) {
    let id = "conf-invariants";
    for batch in 0..4 {
        let inputs = (0..3)
            .map(|i| EntryInput::new("item", json!({"batch": batch, "i": i})))
            .collect();
        let thread = store.append_thread(id, inputs, None).await.unwrap();
        assert_eq!(thread.rev as usize, thread.entries.len());
        for (index, entry) in thread.entries.iter().enumerate() {
            assert_eq!(entry.seq as usize, index);
        }
    }
    let thread = store.load_thread(id).await.unwrap().unwrap();
    assert_eq!(thread.rev, 12);
    assert!(thread.updated_at >= thread.created_at);
}
