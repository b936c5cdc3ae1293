//! End-to-end tests for the instance manager: cold start, thawing,
//! journal concurrency, idle hibernation, crash handling, and durable
//! journal round-trips.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use warden_runtime::{
    codec, Agent, AgentError, AgentEvent, AgentHandle, AgentState, CheckpointKey, EntryInput,
    FileStore, GetOptions, InstanceManager, Journal, JournalError, ManagerConfig, ManagerError,
    MemoryStore, PersistenceConfig, SessionEvent, StepOutcome, Store, SupervisorConfig,
};

/// Counter with a crash switch, driven by event kinds.
struct CounterAgent;

#[async_trait]
impl Agent for CounterAgent {
    fn name(&self) -> &str {
        "CounterAgent"
    }

    fn init(&self, params: &Value) -> Result<AgentState, AgentError> {
        let counter = params.get("counter").and_then(Value::as_i64).unwrap_or(0);
        Ok(AgentState::new().with_field("counter", json!(counter)))
    }

    async fn step(
        &self,
        state: &AgentState,
        event: &AgentEvent,
    ) -> Result<StepOutcome, AgentError> {
        let counter = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
        let mut next = state.clone();
        match event.kind.as_str() {
            "incr" => {
                next.set("counter", json!(counter + 1));
                Ok(StepOutcome::new(next))
            }
            "set" => {
                let value = event.payload.get("counter").cloned().unwrap_or(json!(0));
                next.set("counter", value);
                Ok(StepOutcome::new(next))
            }
            "read" => {
                let reply = AgentEvent::new("value", json!({"counter": counter}));
                Ok(StepOutcome::new(next).with_event(reply))
            }
            "boom" => panic!("requested crash"),
            _ => Ok(StepOutcome::new(next)),
        }
    }
}

async fn read_counter(handle: &AgentHandle) -> i64 {
    let reply = handle
        .call(AgentEvent::new("read", json!({})), Duration::from_secs(1))
        .await
        .expect("agent should answer");
    reply.events[0].payload["counter"].as_i64().unwrap()
}

/// Poll until `predicate` holds or the deadline passes.
async fn eventually(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn cold_start_and_hot_lookup() {
    let manager = InstanceManager::new(ManagerConfig::new("m1", Arc::new(CounterAgent)));

    let p1 = manager.get("u1", GetOptions::default()).await.unwrap();
    let p2 = manager.get("u1", GetOptions::default()).await.unwrap();
    assert_eq!(p1, p2);

    let stats = manager.stats();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.keys, vec!["u1".into()]);

    let found = manager.lookup("u1").expect("registered key");
    assert_eq!(found, p1);
    assert!(manager.lookup("nobody").is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_cold_start_returns_one_instance() {
    let manager = Arc::new(InstanceManager::new(ManagerConfig::new(
        "m-race",
        Arc::new(CounterAgent),
    )));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.get("hot", GetOptions::default()).await.unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    for handle in &handles[1..] {
        assert_eq!(handle, &handles[0]);
    }
    assert_eq!(manager.stats().count, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn thaw_from_checkpoint_ignores_initial_state() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let frozen = AgentState::new().with_field("counter", json!(7));
    let blob = codec::encode_checkpoint(&frozen, false).unwrap();
    store
        .put_checkpoint(&CheckpointKey::new("CounterAgent", "u2"), &blob)
        .await
        .unwrap();

    let mut config = ManagerConfig::new("m2", Arc::new(CounterAgent));
    config.persistence = Some(PersistenceConfig { store });
    let manager = InstanceManager::new(config);

    let opts = GetOptions {
        initial_state: Some(json!({"counter": 99})),
        metadata: HashMap::new(),
    };
    let handle = manager.get("u2", opts).await.unwrap();
    assert_eq!(read_counter(&handle).await, 7);

    manager.shutdown().await;
}

#[tokio::test]
async fn journal_append_with_conflict() {
    let journal = Journal::new(Arc::new(MemoryStore::new()));

    let thread = journal
        .append("t1", vec![EntryInput::new("e1", json!({"n": 1}))], None)
        .await
        .unwrap();
    assert_eq!(thread.rev, 1);

    let err = journal
        .append("t1", vec![EntryInput::new("e2", json!({"n": 2}))], Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, JournalError::Conflict { .. }));

    let thread = journal
        .append("t1", vec![EntryInput::new("e2", json!({"n": 2}))], Some(1))
        .await
        .unwrap();
    assert_eq!(thread.rev, 2);

    let loaded = journal.load("t1").await.unwrap().unwrap();
    assert_eq!(loaded.entries.len(), 2);
    assert_eq!(loaded.entries[0].seq, 0);
    assert_eq!(loaded.entries[1].seq, 1);
}

#[tokio::test]
async fn idle_agent_hibernates_and_thaws() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut config = ManagerConfig::new("m3", Arc::new(CounterAgent));
    config.persistence = Some(PersistenceConfig {
        store: store.clone(),
    });
    config.idle_timeout = Some(Duration::from_millis(100));
    config.sweep_interval = Duration::from_millis(50);
    let manager = Arc::new(InstanceManager::new(config));

    let handle = manager.get("u3", GetOptions::default()).await.unwrap();
    handle
        .call(
            AgentEvent::new("set", json!({"counter": 42})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    // Never attached: the idle deadline fires and the agent is frozen.
    let gone = {
        let manager = manager.clone();
        eventually(Duration::from_secs(2), move || {
            manager.lookup("u3").is_none()
        })
        .await
    };
    assert!(gone, "idle agent should have been evicted");

    let blob = store
        .get_checkpoint(&CheckpointKey::new("CounterAgent", "u3"))
        .await
        .unwrap()
        .expect("checkpoint written on hibernate");
    let state = codec::decode_checkpoint(&blob).unwrap();
    assert_eq!(state.get("counter"), Some(&json!(42)));

    // Thaw on the next get.
    let revived = manager.get("u3", GetOptions::default()).await.unwrap();
    assert_eq!(read_counter(&revived).await, 42);

    manager.shutdown().await;
}

#[tokio::test]
async fn attach_blocks_idle_eviction_until_detach() {
    let mut config = ManagerConfig::new("m4", Arc::new(CounterAgent));
    config.idle_timeout = Some(Duration::from_millis(100));
    config.sweep_interval = Duration::from_millis(50);
    let manager = Arc::new(InstanceManager::new(config));

    let handle = manager.get("u4", GetOptions::default()).await.unwrap();
    manager.attach(&handle).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.lookup("u4").is_some(), "attached agent must survive");

    manager.detach(&handle).unwrap();
    let gone = {
        let manager = manager.clone();
        eventually(Duration::from_secs(2), move || {
            manager.lookup("u4").is_none()
        })
        .await
    };
    assert!(gone, "detached agent should be evicted");

    manager.shutdown().await;
}

#[tokio::test]
async fn supervisor_kill_emits_crash_and_clears_registry() {
    let manager = Arc::new(InstanceManager::new(ManagerConfig::new(
        "m5",
        Arc::new(CounterAgent),
    )));
    let mut events = manager.subscribe();

    let handle = manager.get("u5", GetOptions::default()).await.unwrap();
    handle.kill();

    let crash = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Crashed { key, reason }) => break (key, reason),
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("crash event within deadline");
    assert_eq!(crash.0, "u5".into());
    assert_eq!(crash.1, "killed");

    let gone = {
        let manager = manager.clone();
        eventually(Duration::from_millis(500), move || {
            manager.lookup("u5").is_none()
        })
        .await
    };
    assert!(gone, "crashed entry should be reaped");

    manager.shutdown().await;
}

#[tokio::test]
async fn crashing_key_reports_restart_exhaustion_then_recovers() {
    let mut config = ManagerConfig::new("m6", Arc::new(CounterAgent));
    config.restart = SupervisorConfig {
        max_restarts: 0,
        restart_window: Duration::from_secs(5),
    };
    // Keep the dead entry around long enough for the next get to observe
    // the terminal exit reason instead of racing the reaper.
    config.cleanup_delay = Duration::from_secs(2);
    let manager = Arc::new(InstanceManager::new(config));

    let handle = manager.get("u6", GetOptions::default()).await.unwrap();
    // Three consecutive step panics stop the runtime; with no restart
    // budget the supervisor gives up immediately.
    for _ in 0..3 {
        handle.send(AgentEvent::new("boom", json!({})));
    }

    let dead = {
        let handle = handle.clone();
        eventually(Duration::from_secs(2), move || !handle.is_alive()).await
    };
    assert!(dead, "supervisor should give up");

    let err = manager.get("u6", GetOptions::default()).await.unwrap_err();
    assert!(matches!(err, ManagerError::MaxRestartsExceeded { .. }));

    // The terminal entry was reaped; the key is startable again.
    let fresh = manager.get("u6", GetOptions::default()).await.unwrap();
    assert_eq!(read_counter(&fresh).await, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn stop_hibernates_and_forgets_the_key() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut config = ManagerConfig::new("m7", Arc::new(CounterAgent));
    config.persistence = Some(PersistenceConfig {
        store: store.clone(),
    });
    let manager = InstanceManager::new(config);

    let handle = manager.get("u7", GetOptions::default()).await.unwrap();
    handle
        .call(
            AgentEvent::new("set", json!({"counter": 5})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    manager.stop("u7").await.unwrap();
    assert!(manager.lookup("u7").is_none());
    assert!(matches!(
        manager.stop("u7").await,
        Err(ManagerError::NotFound(_))
    ));

    let blob = store
        .get_checkpoint(&CheckpointKey::new("CounterAgent", "u7"))
        .await
        .unwrap()
        .expect("graceful stop writes a checkpoint");
    let state = codec::decode_checkpoint(&blob).unwrap();
    assert_eq!(state.get("counter"), Some(&json!(5)));

    manager.shutdown().await;
}

fn random_entry(rng: &mut impl Rng, i: usize) -> EntryInput {
    let kinds = ["note", "tool_call", "tool_result", "signal"];
    let kind = kinds[rng.gen_range(0..kinds.len())];
    let payload = match rng.gen_range(0..4) {
        0 => json!({"n": rng.gen::<i64>()}),
        1 => json!({"text": format!("entry-{i}"), "flag": rng.gen::<bool>()}),
        2 => json!({"list": (0..rng.gen_range(0..5)).collect::<Vec<_>>()}),
        _ => json!({"nested": {"level": {"value": rng.gen::<f64>()}}}),
    };
    let mut entry = EntryInput::new(kind, payload);
    if rng.gen_bool(0.3) {
        entry = entry.with_ref("prev", format!("e-{}", i.saturating_sub(1)));
    }
    entry
}

#[tokio::test]
async fn file_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = rand::thread_rng();

    let before = {
        let store = FileStore::new(dir.path()).unwrap();
        let mut last = None;
        for batch_start in (0..1000).step_by(50) {
            let entries = (batch_start..batch_start + 50)
                .map(|i| random_entry(&mut rng, i))
                .collect();
            last = Some(store.append_thread("big", entries, None).await.unwrap());
        }
        last.unwrap()
    };
    assert_eq!(before.rev, 1000);

    // A fresh store over the same directory simulates a process restart.
    let reopened = FileStore::new(dir.path()).unwrap();
    let after = reopened.load_thread("big").await.unwrap().unwrap();

    assert_eq!(after, before);
    assert_eq!(after.entries.len(), 1000);
    for (index, entry) in after.entries.iter().enumerate() {
        assert_eq!(entry.seq as usize, index);
    }
}

#[tokio::test]
async fn manager_shutdown_is_idempotent_and_blocks_get() {
    let manager = InstanceManager::new(ManagerConfig::new("m8", Arc::new(CounterAgent)));
    manager.get("u8", GetOptions::default()).await.unwrap();

    manager.shutdown().await;
    manager.shutdown().await;

    assert!(matches!(
        manager.get("u9", GetOptions::default()).await,
        Err(ManagerError::ShuttingDown)
    ));
    assert_eq!(manager.stats().count, 0);
}
