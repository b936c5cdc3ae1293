//! Keyed-singleton registry and lifecycle controller
//!
//! The [`InstanceManager`] guarantees exactly one live agent per key:
//! lookups are lock-free reads of a concurrent registry, cold starts run
//! under a per-key lock with a double-check, idle agents are hibernated
//! and evicted by a manager-wide sweeper, and crashed supervision trees
//! are observed through a monitor channel and reaped after a short delay
//! so concurrent lookups see the transition instead of a silent miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};

use crate::agent::{Agent, RuntimeConfig, RuntimeHandle, RuntimePersistence};
use crate::codec;
use crate::journal::Journal;
use crate::store::{CheckpointKey, Store};
use crate::supervisor::{
    ExitReason, MonitorEvent, SessionSupervisor, SupervisorConfig, SupervisorHandle,
    SupervisorParams,
};
use crate::types::{
    now_ms, AgentError, AgentEvent, AgentKey, AgentState, AgentStatus, CallReply, ManagerError,
    MonitorId,
};

/// Store wiring for hibernation and thawing.
#[derive(Clone)]
pub struct PersistenceConfig {
    pub store: Arc<dyn Store>,
}

/// Immutable manager configuration.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Distinguishes this manager in logs and events.
    pub name: String,
    /// Agent module launched on a registry miss.
    pub agent: Arc<dyn Agent>,
    /// Zero-attachment time before hibernation + stop; `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Checkpoint store; `None` runs memory-only.
    pub persistence: Option<PersistenceConfig>,
    /// DLQ sink handed to every runtime.
    pub journal: Option<Arc<Journal>>,
    /// Backpressure for thundering herds on cold start.
    pub max_concurrent_starts: usize,
    /// Idle sweeper tick; wakeup timers make eviction latency independent
    /// of this resolution.
    pub sweep_interval: Duration,
    /// Budget for graceful shutdown before force-kill.
    pub stop_timeout: Duration,
    /// Retention of dead entries so lookups observe the transition.
    pub cleanup_delay: Duration,
    /// Primary-runtime restart policy per key.
    pub restart: SupervisorConfig,
    /// Gzip checkpoint bodies.
    pub compress_checkpoints: bool,
    /// Slow-step logging threshold for runtimes.
    pub slow_step_threshold: Duration,
}

impl ManagerConfig {
    pub fn new(name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            agent,
            idle_timeout: None,
            persistence: None,
            journal: None,
            max_concurrent_starts: 64,
            sweep_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            cleanup_delay: Duration::from_millis(50),
            restart: SupervisorConfig::default(),
            compress_checkpoints: false,
            slow_step_threshold: Duration::from_secs(1),
        }
    }
}

/// Options for [`InstanceManager::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Parameters handed to [`Agent::init`] for a fresh start. Ignored
    /// when a checkpoint is thawed.
    pub initial_state: Option<Value>,
    /// Opaque annotations stored on the registry entry.
    pub metadata: HashMap<String, String>,
}

/// Reference to one live agent, valid across primary restarts.
#[derive(Clone)]
pub struct AgentHandle {
    key: AgentKey,
    supervisor: SupervisorHandle,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("key", &self.key)
            .field("monitor_id", &self.supervisor.monitor_id())
            .finish()
    }
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.supervisor.monitor_id() == other.supervisor.monitor_id()
    }
}

impl Eq for AgentHandle {}

impl AgentHandle {
    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    /// Current primary runtime (follows supervisor restarts).
    pub fn runtime(&self) -> RuntimeHandle {
        self.supervisor.primary()
    }

    pub fn status(&self) -> AgentStatus {
        self.supervisor.primary().status()
    }

    pub fn is_alive(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Fire-and-forget delivery to the agent's inbox.
    pub fn send(&self, event: AgentEvent) {
        self.supervisor.primary().send(event);
    }

    /// Synchronous round-trip through the agent's event loop.
    pub async fn call(&self, event: AgentEvent, timeout: Duration) -> Result<CallReply, AgentError> {
        self.supervisor.primary().call(event, timeout).await
    }

    /// Wait for the agent to settle into `completed` or `failed`.
    pub async fn await_settled(&self, timeout: Duration) -> Result<AgentStatus, AgentError> {
        self.supervisor.primary().await_settled(timeout).await
    }

    /// Force-kill the whole supervision tree (crash semantics).
    pub fn kill(&self) {
        self.supervisor.kill();
    }

    pub(crate) fn monitor_id(&self) -> MonitorId {
        self.supervisor.monitor_id()
    }

    pub(crate) fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }
}

/// Lifecycle notifications broadcast by the manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { key: AgentKey },
    Crashed { key: AgentKey, reason: String },
    Evicted { key: AgentKey },
    HibernateFailed { key: AgentKey, error: String },
}

/// Registry snapshot.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub count: usize,
    pub keys: Vec<AgentKey>,
}

struct RegistryEntry {
    key: AgentKey,
    handle: AgentHandle,
    monitor_id: MonitorId,
    status: AgentStatus,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    attach_count: u32,
    idle_deadline: Option<Instant>,
    metadata: HashMap<String, String>,
}

impl RegistryEntry {
    /// Live means the manager has not begun tearing it down AND the
    /// supervision tree itself is still up. The second check closes the
    /// window between a tree dying and the monitor event being processed.
    fn is_live(&self) -> bool {
        !self.status.is_terminal() && !self.handle.supervisor().is_finished()
    }
}

enum ExecCommand {
    Sweep,
    Cleanup { key: AgentKey, monitor_id: MonitorId },
}

/// The keyed-singleton instance manager.
pub struct InstanceManager {
    config: ManagerConfig,
    registry: Arc<DashMap<AgentKey, RegistryEntry>>,
    start_locks: DashMap<AgentKey, Arc<tokio::sync::Mutex<()>>>,
    start_permits: Arc<Semaphore>,
    monitor_tx: mpsc::UnboundedSender<MonitorEvent>,
    exec_tx: mpsc::UnboundedSender<ExecCommand>,
    events: broadcast::Sender<SessionEvent>,
    is_running: Arc<RwLock<bool>>,
    shutdown_notify: Arc<Notify>,
}

impl InstanceManager {
    /// Create the manager and start its executor loop.
    pub fn new(config: ManagerConfig) -> Self {
        let registry = Arc::new(DashMap::new());
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let is_running = Arc::new(RwLock::new(true));
        let shutdown_notify = Arc::new(Notify::new());

        let executor = Executor {
            manager_name: config.name.clone(),
            registry: registry.clone(),
            events: events.clone(),
            exec_tx: exec_tx.clone(),
            sweep_interval: config.sweep_interval,
            stop_timeout: config.stop_timeout,
            cleanup_delay: config.cleanup_delay,
            hibernate_on_stop: config.persistence.is_some(),
            is_running: is_running.clone(),
            shutdown_notify: shutdown_notify.clone(),
        };
        tokio::spawn(executor.run(monitor_rx, exec_rx));

        Self {
            start_permits: Arc::new(Semaphore::new(config.max_concurrent_starts.max(1))),
            config,
            registry,
            start_locks: DashMap::new(),
            monitor_tx,
            exec_tx,
            events,
            is_running,
            shutdown_notify,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Get-or-start: returns the live handle for `key`, starting (and
    /// possibly thawing) the agent on a miss.
    pub async fn get(
        &self,
        key: impl Into<AgentKey>,
        opts: GetOptions,
    ) -> Result<AgentHandle, ManagerError> {
        if !*self.is_running.read() {
            return Err(ManagerError::ShuttingDown);
        }
        let key = key.into();

        // Fast path: single registry read.
        if let Some(entry) = self.registry.get(&key) {
            if entry.is_live() {
                return Ok(entry.handle.clone());
            }
        }

        let _permit = self
            .start_permits
            .acquire()
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;
        let lock = self
            .start_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-check under the per-key lock to cover lost races.
        if let Some(handle) = {
            let entry = self.registry.get(&key);
            match entry {
                Some(entry) if entry.is_live() => {
                    return Ok(entry.handle.clone());
                }
                Some(entry) => Some(entry.handle.clone()),
                None => None,
            }
        } {
            // A dead entry is still being reaped; wait for the tree to
            // actually exit before replacing it, preserving the
            // one-pid-per-key invariant.
            handle.supervisor().wait_exited(self.config.stop_timeout).await;
            self.registry
                .remove_if(&key, |_, entry| entry.monitor_id == handle.monitor_id());
            if matches!(
                handle.supervisor().exit_reason(),
                Some(ExitReason::MaxRestartsExceeded)
            ) {
                return Err(ManagerError::MaxRestartsExceeded { key });
            }
        }

        let state = self.build_state(&key, &opts).await?;
        let monitor_id = MonitorId::new();
        let supervisor = SessionSupervisor::start(SupervisorParams {
            key: key.clone(),
            monitor_id,
            agent: self.config.agent.clone(),
            initial_state: state,
            runtime_config: self.runtime_config(&key),
            config: self.config.restart.clone(),
            monitor: self.monitor_tx.clone(),
        });
        let handle = AgentHandle {
            key: key.clone(),
            supervisor,
        };

        let now = now_ms();
        let idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
        let entry = RegistryEntry {
            key: key.clone(),
            handle: handle.clone(),
            monitor_id,
            status: AgentStatus::Idle,
            error: None,
            created_at: now,
            updated_at: now,
            attach_count: 0,
            idle_deadline,
            metadata: opts.metadata,
        };

        match self.registry.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) if occupied.get().is_live() => {
                // Lost insert race: hand back the winner and fold our tree.
                let winner = occupied.get().handle.clone();
                drop(occupied);
                let loser = handle;
                tokio::spawn(async move {
                    let _ = loser.supervisor().shutdown(false, Duration::from_secs(5)).await;
                });
                tracing::debug!("Manager {}: lost start race for {}", self.config.name, key);
                return Ok(winner);
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        if let Some(deadline) = idle_deadline {
            self.arm_wakeup(deadline);
        }
        let _ = self.events.send(SessionEvent::Started { key: key.clone() });
        tracing::info!("Manager {}: started agent for key {}", self.config.name, key);
        Ok(handle)
    }

    /// Pure registry read, no side effects.
    pub fn lookup(&self, key: impl Into<AgentKey>) -> Option<AgentHandle> {
        let key = key.into();
        self.registry.get(&key).and_then(|entry| {
            if entry.is_live() {
                Some(entry.handle.clone())
            } else {
                None
            }
        })
    }

    /// Graceful stop of one key: hibernate (when persistence is on), stop
    /// the tree, verify death through the monitor, drop the entry.
    pub async fn stop(&self, key: impl Into<AgentKey>) -> Result<(), ManagerError> {
        let key = key.into();
        let handle = {
            let mut entry = self
                .registry
                .get_mut(&key)
                .ok_or_else(|| ManagerError::NotFound(key.clone()))?;
            if entry.status.is_terminal() {
                return Err(ManagerError::NotFound(key.clone()));
            }
            entry.status = AgentStatus::Terminating;
            entry.updated_at = now_ms();
            entry.handle.clone()
        };

        let hibernate = self.config.persistence.is_some();
        match handle.supervisor().shutdown(hibernate, self.config.stop_timeout).await {
            Ok(()) => {}
            Err(AgentError::Timeout) => {
                tracing::warn!(
                    "Manager {}: shutdown of {} timed out, force-killing",
                    self.config.name,
                    key
                );
                handle.supervisor().kill();
            }
            Err(e) => {
                tracing::warn!(
                    "Manager {}: hibernate during stop of {} failed: {}",
                    self.config.name,
                    key,
                    e
                );
                let _ = self.events.send(SessionEvent::HibernateFailed {
                    key: key.clone(),
                    error: e.to_string(),
                });
            }
        }

        if !handle.supervisor().wait_exited(self.config.stop_timeout).await {
            return Err(ManagerError::Timeout);
        }
        // Guarded removal: never touch a newer incarnation under this key.
        self.registry
            .remove_if(&key, |_, entry| entry.monitor_id == handle.monitor_id());
        tracing::info!("Manager {}: stopped agent for key {}", self.config.name, key);
        Ok(())
    }

    /// Signal caller interest: a positive attach count pauses idle
    /// eviction.
    pub fn attach(&self, handle: &AgentHandle) -> Result<(), ManagerError> {
        let mut entry = self
            .registry
            .get_mut(handle.key())
            .ok_or_else(|| ManagerError::NotFound(handle.key().clone()))?;
        entry.attach_count += 1;
        entry.idle_deadline = None;
        entry.updated_at = now_ms();
        Ok(())
    }

    /// Drop caller interest; the last detach arms the idle deadline.
    pub fn detach(&self, handle: &AgentHandle) -> Result<(), ManagerError> {
        let deadline = {
            let mut entry = self
                .registry
                .get_mut(handle.key())
                .ok_or_else(|| ManagerError::NotFound(handle.key().clone()))?;
            entry.attach_count = entry.attach_count.saturating_sub(1);
            entry.updated_at = now_ms();
            if entry.attach_count == 0 {
                entry.idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
                entry.idle_deadline
            } else {
                None
            }
        };
        if let Some(deadline) = deadline {
            self.arm_wakeup(deadline);
        }
        Ok(())
    }

    /// Snapshot of live keys.
    pub fn stats(&self) -> ManagerStats {
        let keys: Vec<AgentKey> = self
            .registry
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| entry.key.clone())
            .collect();
        ManagerStats {
            count: keys.len(),
            keys,
        }
    }

    /// Stop the executor and gracefully fold every live tree. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut running = self.is_running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown_notify.notify_waiters();

        let keys: Vec<AgentKey> = self.registry.iter().map(|entry| entry.key.clone()).collect();
        for key in keys {
            if let Err(e) = self.stop(key.clone()).await {
                tracing::debug!(
                    "Manager {}: shutdown stop of {} failed: {}",
                    self.config.name,
                    key,
                    e
                );
                self.registry.remove(&key);
            }
        }
        tracing::info!("Manager {} shut down", self.config.name);
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn build_state(
        &self,
        key: &AgentKey,
        opts: &GetOptions,
    ) -> Result<AgentState, ManagerError> {
        if let Some(persistence) = &self.config.persistence {
            let checkpoint_key = self.checkpoint_key(key);
            if let Some(bytes) = persistence.store.get_checkpoint(&checkpoint_key).await? {
                let mut state = codec::decode_checkpoint(&bytes)?;
                // Thaw: fields survive, the lifecycle does not.
                state.status = AgentStatus::Idle;
                state.error = None;
                tracing::debug!(
                    "Manager {}: thawed checkpoint for key {}",
                    self.config.name,
                    key
                );
                return Ok(state);
            }
        }
        let params = opts.initial_state.clone().unwrap_or(Value::Null);
        self.config
            .agent
            .init(&params)
            .map_err(ManagerError::Agent)
    }

    fn checkpoint_key(&self, key: &AgentKey) -> CheckpointKey {
        CheckpointKey::new(self.config.agent.name(), key.as_str())
    }

    fn runtime_config(&self, key: &AgentKey) -> RuntimeConfig {
        RuntimeConfig {
            slow_step_threshold: self.config.slow_step_threshold,
            journal: self.config.journal.clone(),
            persistence: self.config.persistence.as_ref().map(|p| RuntimePersistence {
                store: p.store.clone(),
                key: self.checkpoint_key(key),
            }),
            compress_checkpoints: self.config.compress_checkpoints,
            ..RuntimeConfig::default()
        }
    }

    fn arm_wakeup(&self, deadline: Instant) {
        let exec_tx = self.exec_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until((deadline + Duration::from_millis(5)).into()).await;
            let _ = exec_tx.send(ExecCommand::Sweep);
        });
    }
}

/// Serializes lifecycle transitions: idle sweeps, monitor downs, delayed
/// cleanups all run on this single loop.
struct Executor {
    manager_name: String,
    registry: Arc<DashMap<AgentKey, RegistryEntry>>,
    events: broadcast::Sender<SessionEvent>,
    exec_tx: mpsc::UnboundedSender<ExecCommand>,
    sweep_interval: Duration,
    stop_timeout: Duration,
    cleanup_delay: Duration,
    hibernate_on_stop: bool,
    is_running: Arc<RwLock<bool>>,
    shutdown_notify: Arc<Notify>,
}

impl Executor {
    async fn run(
        self,
        mut monitor_rx: mpsc::UnboundedReceiver<MonitorEvent>,
        mut exec_rx: mpsc::UnboundedReceiver<ExecCommand>,
    ) {
        let mut ticker = tokio::time::interval(self.sweep_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !*self.is_running.read() {
                        break;
                    }
                    self.sweep().await;
                }
                event = monitor_rx.recv() => {
                    match event {
                        Some(event) => self.handle_down(event),
                        None => break,
                    }
                }
                command = exec_rx.recv() => {
                    match command {
                        Some(ExecCommand::Sweep) => self.sweep().await,
                        Some(ExecCommand::Cleanup { key, monitor_id }) => {
                            self.cleanup(key, monitor_id)
                        }
                        None => break,
                    }
                }
                _ = self.shutdown_notify.notified() => break,
            }
        }
        tracing::debug!("Manager {} executor stopped", self.manager_name);
    }

    /// Evict every entry whose idle deadline has passed with no attachments.
    async fn sweep(&self) {
        let now = Instant::now();
        let due: Vec<AgentKey> = self
            .registry
            .iter()
            .filter(|entry| {
                entry.attach_count == 0
                    && !entry.status.is_terminal()
                    && entry.idle_deadline.map_or(false, |deadline| deadline <= now)
            })
            .map(|entry| entry.key.clone())
            .collect();

        for key in due {
            self.evict(key).await;
        }
    }

    async fn evict(&self, key: AgentKey) {
        let handle = {
            let mut entry = match self.registry.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            // Re-check under the entry lock: an attach may have landed
            // between the scan and now.
            if entry.status.is_terminal()
                || entry.attach_count > 0
                || entry.idle_deadline.map_or(true, |d| d > Instant::now())
            {
                return;
            }
            entry.status = AgentStatus::Terminating;
            entry.updated_at = now_ms();
            entry.handle.clone()
        };

        tracing::info!(
            "Manager {}: hibernating idle agent for key {}",
            self.manager_name,
            key
        );
        match handle
            .supervisor()
            .shutdown(self.hibernate_on_stop, self.stop_timeout)
            .await
        {
            Ok(()) => {}
            Err(AgentError::Timeout) => {
                tracing::warn!(
                    "Manager {}: idle shutdown of {} timed out, force-killing",
                    self.manager_name,
                    key
                );
                handle.supervisor().kill();
            }
            Err(e) => {
                // The checkpoint write failed; in-flight state is lost but
                // termination still proceeds.
                tracing::warn!(
                    "Manager {}: hibernate of idle {} failed: {}",
                    self.manager_name,
                    key,
                    e
                );
                let _ = self.events.send(SessionEvent::HibernateFailed {
                    key: key.clone(),
                    error: e.to_string(),
                });
            }
        }

        handle.supervisor().wait_exited(self.stop_timeout).await;
        self.registry
            .remove_if(&key, |_, entry| entry.monitor_id == handle.monitor_id());
        let _ = self.events.send(SessionEvent::Evicted { key });
    }

    /// A supervision tree died: annotate the entry, broadcast on crashes,
    /// and schedule verified removal.
    fn handle_down(&self, event: MonitorEvent) {
        // Locate by monitor id first; fall back to the key only when that
        // entry's tree is actually dead, so a newer incarnation under the
        // same key is never touched.
        let key = self
            .registry
            .iter()
            .find(|entry| entry.monitor_id == event.monitor_id)
            .map(|entry| entry.key.clone())
            .or_else(|| {
                self.registry.get(&event.key).and_then(|entry| {
                    if entry.handle.supervisor().is_finished() {
                        Some(entry.key.clone())
                    } else {
                        None
                    }
                })
            });
        let key = match key {
            Some(key) => key,
            None => {
                tracing::debug!(
                    "Manager {}: monitor down for unknown entry ({})",
                    self.manager_name,
                    event.key
                );
                return;
            }
        };

        let crashed = {
            let mut entry = match self.registry.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            if entry.monitor_id != event.monitor_id {
                return;
            }
            entry.status = AgentStatus::Terminated;
            entry.updated_at = now_ms();
            let crashed = event.reason.is_crash();
            if crashed {
                entry.error = Some(event.reason.to_string());
            }
            crashed
        };

        if crashed {
            tracing::warn!(
                "Manager {}: session {} crashed: {}",
                self.manager_name,
                key,
                event.reason
            );
            let _ = self.events.send(SessionEvent::Crashed {
                key: key.clone(),
                reason: event.reason.to_string(),
            });
        }
        self.schedule_cleanup(key, event.monitor_id);
    }

    fn schedule_cleanup(&self, key: AgentKey, monitor_id: MonitorId) {
        let exec_tx = self.exec_tx.clone();
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = exec_tx.send(ExecCommand::Cleanup { key, monitor_id });
        });
    }

    /// Remove a dead entry once its tree has verifiably exited; otherwise
    /// try again later.
    fn cleanup(&self, key: AgentKey, monitor_id: MonitorId) {
        let removed = self.registry.remove_if(&key, |_, entry| {
            entry.monitor_id == monitor_id && entry.handle.supervisor().is_finished()
        });
        if removed.is_some() {
            tracing::debug!("Manager {}: reaped entry for {}", self.manager_name, key);
            return;
        }
        // Still winding down (or a newer incarnation took the key).
        let reschedule = self
            .registry
            .get(&key)
            .map_or(false, |entry| entry.monitor_id == monitor_id);
        if reschedule {
            self.schedule_cleanup(key, monitor_id);
        }
    }
}
