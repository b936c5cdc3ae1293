//! Per-key supervision tree
//!
//! One [`SessionSupervisor`] wraps the primary [`AgentRuntime`] of a key
//! plus any child runtimes the agent spawns. Strategy is one-for-one: a
//! child exit never touches its siblings. A crash of the primary runtime
//! is absorbed by restarting it, at most `max_restarts` times within
//! `restart_window`; beyond that the supervisor itself exits with
//! [`ExitReason::MaxRestartsExceeded`], which the manager observes through
//! its monitor channel and treats as terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::agent::{
    Agent, AgentRuntime, ChildSpec, RunExit, RuntimeConfig, RuntimeContext, RuntimeHandle,
};
use crate::types::{AgentError, AgentKey, AgentState, MonitorId, StopReason, SupervisorError};

/// Commands accepted by a running supervisor.
pub enum SupervisorCommand {
    /// Start a child runtime under this tree.
    SpawnChild(ChildSpec),
    /// Stop a child runtime by name.
    StopChild(String),
    /// Orderly tree shutdown; `hibernate` freezes the primary first.
    Shutdown {
        hibernate: bool,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    /// Internal: a child runtime's loop ended.
    ChildExited { name: String, exit: RunExit },
}

/// Restart policy for the primary runtime.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 1,
            restart_window: Duration::from_secs(5),
        }
    }
}

/// Why a supervision tree exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Primary runtime exited cleanly (stop or hibernation).
    Normal,
    /// Primary crashed and the restart budget was exhausted.
    MaxRestartsExceeded,
    /// Forceful termination via [`SupervisorHandle::kill`].
    Killed,
}

impl ExitReason {
    pub fn is_crash(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::MaxRestartsExceeded => write!(f, "max_restarts_exceeded"),
            ExitReason::Killed => write!(f, "killed"),
        }
    }
}

/// Emitted exactly once when a supervision tree dies.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub monitor_id: MonitorId,
    pub key: AgentKey,
    pub reason: ExitReason,
}

/// Everything needed to start one supervision tree.
pub struct SupervisorParams {
    pub key: AgentKey,
    pub monitor_id: MonitorId,
    pub agent: Arc<dyn Agent>,
    pub initial_state: AgentState,
    pub runtime_config: RuntimeConfig,
    pub config: SupervisorConfig,
    pub monitor: mpsc::UnboundedSender<MonitorEvent>,
}

/// Cloneable reference to a running supervision tree.
#[derive(Clone)]
pub struct SupervisorHandle {
    monitor_id: MonitorId,
    key: AgentKey,
    command: mpsc::UnboundedSender<SupervisorCommand>,
    kill: Arc<Notify>,
    finished: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    exit_reason: Arc<RwLock<Option<ExitReason>>>,
    primary: Arc<RwLock<RuntimeHandle>>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("key", &self.key)
            .field("monitor_id", &self.monitor_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl SupervisorHandle {
    pub fn monitor_id(&self) -> MonitorId {
        self.monitor_id
    }

    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    /// Handle to the current primary runtime. Survives restarts: after a
    /// restart this returns the replacement.
    pub fn primary(&self) -> RuntimeHandle {
        self.primary.read().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Why the tree exited; `None` while it is still running. Written
    /// before the finished flag, so a finished tree always has a reason.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.read().clone()
    }

    /// Ask the tree to spawn a child runtime.
    pub fn spawn_child(&self, spec: ChildSpec) -> Result<(), SupervisorError> {
        self.command
            .send(SupervisorCommand::SpawnChild(spec))
            .map_err(|_| SupervisorError::Exited)
    }

    /// Ask the tree to stop a child runtime.
    pub fn stop_child(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        self.command
            .send(SupervisorCommand::StopChild(name.into()))
            .map_err(|_| SupervisorError::Exited)
    }

    /// Orderly shutdown. With `hibernate` the primary's state is frozen to
    /// the store first; a hibernate failure is returned but never blocks
    /// the stop. Times out with [`AgentError::Timeout`] if the tree does
    /// not acknowledge.
    pub async fn shutdown(&self, hibernate: bool, timeout: Duration) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        if self
            .command
            .send(SupervisorCommand::Shutdown {
                hibernate,
                reply: tx,
            })
            .is_err()
        {
            // Already exited.
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(AgentError::Timeout),
        }
    }

    /// Force-kill the whole tree. Monitors observe [`ExitReason::Killed`].
    pub fn kill(&self) {
        // notify_one stores a permit, so a kill issued before the tree's
        // task first polls is not lost.
        self.kill.notify_one();
    }

    /// Await actual tree death; returns false on timeout.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_finished() {
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return self.is_finished(),
            };
            let _ = tokio::time::timeout(remaining, self.exit_notify.notified()).await;
        }
    }
}

/// Factory for supervision trees.
pub struct SessionSupervisor;

impl SessionSupervisor {
    pub fn start(params: SupervisorParams) -> SupervisorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let exit_reason = Arc::new(RwLock::new(None));

        let (primary_handle, primary_join) = AgentRuntime::start(
            params.key.to_string(),
            params.agent.clone(),
            params.initial_state.clone(),
            params.runtime_config.clone(),
            RuntimeContext {
                parent: None,
                supervisor: Some(command_tx.clone()),
            },
        );
        let primary = Arc::new(RwLock::new(primary_handle));

        let handle = SupervisorHandle {
            monitor_id: params.monitor_id,
            key: params.key.clone(),
            command: command_tx.clone(),
            kill: kill.clone(),
            finished: finished.clone(),
            exit_notify: exit_notify.clone(),
            exit_reason: exit_reason.clone(),
            primary: primary.clone(),
        };

        let task = SupervisorTask {
            key: params.key,
            monitor_id: params.monitor_id,
            agent: params.agent,
            restart_state: params.initial_state,
            runtime_config: params.runtime_config,
            config: params.config,
            monitor: params.monitor,
            command_tx,
            command_rx,
            kill,
            finished,
            exit_notify,
            exit_reason,
            primary,
            children: HashMap::new(),
            restarts: Vec::new(),
        };
        tokio::spawn(task.run(primary_join));

        handle
    }
}

struct ChildSlot {
    handle: RuntimeHandle,
    abort: tokio::task::AbortHandle,
}

struct SupervisorTask {
    key: AgentKey,
    monitor_id: MonitorId,
    agent: Arc<dyn Agent>,
    restart_state: AgentState,
    runtime_config: RuntimeConfig,
    config: SupervisorConfig,
    monitor: mpsc::UnboundedSender<MonitorEvent>,
    command_tx: mpsc::UnboundedSender<SupervisorCommand>,
    command_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    kill: Arc<Notify>,
    finished: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    exit_reason: Arc<RwLock<Option<ExitReason>>>,
    primary: Arc<RwLock<RuntimeHandle>>,
    children: HashMap<String, ChildSlot>,
    restarts: Vec<Instant>,
}

impl SupervisorTask {
    async fn run(mut self, mut primary_join: JoinHandle<RunExit>) {
        let reason = loop {
            tokio::select! {
                joined = &mut primary_join => {
                    match joined {
                        Ok(RunExit::Clean) | Ok(RunExit::Hibernated) => break ExitReason::Normal,
                        Ok(RunExit::Failed(message)) => {
                            match self.try_restart(&message) {
                                Some(join) => primary_join = join,
                                None => break ExitReason::MaxRestartsExceeded,
                            }
                        }
                        Err(join_error) => {
                            let message = format!("runtime task died: {}", join_error);
                            match self.try_restart(&message) {
                                Some(join) => primary_join = join,
                                None => break ExitReason::MaxRestartsExceeded,
                            }
                        }
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(SupervisorCommand::SpawnChild(spec)) => self.spawn_child(spec),
                        Some(SupervisorCommand::StopChild(name)) => {
                            match self.children.remove(&name) {
                                Some(child) => {
                                    let _ = child.handle.stop(StopReason::Normal).await;
                                }
                                None => tracing::debug!(
                                    "Supervisor {}: stop for unknown child {}",
                                    self.key,
                                    name
                                ),
                            }
                        }
                        Some(SupervisorCommand::ChildExited { name, exit }) => {
                            // One-for-one: the exit affects nobody else, and
                            // children are temporary (no child restarts).
                            self.children.remove(&name);
                            if let RunExit::Failed(message) = exit {
                                tracing::warn!(
                                    "Supervisor {}: child {} crashed: {}",
                                    self.key,
                                    name,
                                    message
                                );
                            }
                        }
                        Some(SupervisorCommand::Shutdown { hibernate, reply }) => {
                            let result = self.shutdown_primary(hibernate).await;
                            let _ = reply.send(result);
                            break ExitReason::Normal;
                        }
                        None => {
                            // Every command sender dropped; tear down.
                            let _ = self.shutdown_primary(false).await;
                            break ExitReason::Normal;
                        }
                    }
                }
                _ = self.kill.notified() => {
                    primary_join.abort();
                    for child in self.children.values() {
                        child.abort.abort();
                    }
                    break ExitReason::Killed;
                }
            }
        };

        self.teardown_children(reason == ExitReason::Killed).await;
        *self.exit_reason.write() = Some(reason.clone());
        self.finished.store(true, Ordering::Release);
        self.exit_notify.notify_waiters();
        if reason.is_crash() {
            tracing::warn!("Supervisor {} exited: {}", self.key, reason);
        } else {
            tracing::debug!("Supervisor {} exited: {}", self.key, reason);
        }
        let _ = self.monitor.send(MonitorEvent {
            monitor_id: self.monitor_id,
            key: self.key.clone(),
            reason,
        });
    }

    /// Restart the primary if the window budget allows; None means the
    /// budget is exhausted.
    fn try_restart(&mut self, cause: &str) -> Option<JoinHandle<RunExit>> {
        let window = self.config.restart_window;
        self.restarts.retain(|at| at.elapsed() < window);
        if self.restarts.len() >= self.config.max_restarts as usize {
            tracing::error!(
                "Supervisor {}: primary crashed ({}) with restart budget exhausted",
                self.key,
                cause
            );
            return None;
        }
        self.restarts.push(Instant::now());
        tracing::warn!(
            "Supervisor {}: restarting primary after crash ({}), attempt {}/{}",
            self.key,
            cause,
            self.restarts.len(),
            self.config.max_restarts
        );

        let (handle, join) = AgentRuntime::start(
            self.key.to_string(),
            self.agent.clone(),
            self.restart_state.clone(),
            self.runtime_config.clone(),
            RuntimeContext {
                parent: None,
                supervisor: Some(self.command_tx.clone()),
            },
        );
        *self.primary.write() = handle;
        Some(join)
    }

    fn spawn_child(&mut self, spec: ChildSpec) {
        let name = spec.name.clone();
        if let Some(previous) = self.children.remove(&name) {
            tracing::debug!(
                "Supervisor {}: replacing child {}",
                self.key,
                name
            );
            previous.abort.abort();
        }

        let child_id = format!("{}/{}", self.key, name);
        let (handle, join) = AgentRuntime::start(
            child_id,
            spec.agent,
            spec.initial_state,
            self.runtime_config.clone(),
            RuntimeContext {
                parent: Some(self.primary.read().clone()),
                supervisor: Some(self.command_tx.clone()),
            },
        );
        let abort = join.abort_handle();

        let watcher_name = name.clone();
        let watcher_tx = self.command_tx.clone();
        tokio::spawn(async move {
            let exit = match join.await {
                Ok(exit) => exit,
                Err(e) => RunExit::Failed(format!("child task died: {}", e)),
            };
            let _ = watcher_tx.send(SupervisorCommand::ChildExited {
                name: watcher_name,
                exit,
            });
        });

        self.children.insert(name, ChildSlot { handle, abort });
    }

    async fn shutdown_primary(&self, hibernate: bool) -> Result<(), AgentError> {
        let primary = self.primary.read().clone();
        let mut hibernate_error = None;
        if hibernate {
            match primary.hibernate().await {
                // Hibernation exits the loop on success.
                Ok(()) => return Ok(()),
                Err(AgentError::NotFound) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Supervisor {}: hibernate failed, terminating without checkpoint: {}",
                        self.key,
                        e
                    );
                    hibernate_error = Some(e);
                }
            }
        }
        let _ = primary.stop(StopReason::Shutdown).await;
        match hibernate_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn teardown_children(&mut self, force: bool) {
        for (name, child) in self.children.drain() {
            if force {
                child.abort.abort();
            } else if child.handle.is_alive() {
                tracing::debug!("Supervisor {}: stopping child {}", self.key, name);
                let _ = child.handle.stop(StopReason::Shutdown).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StepOutcome;
    use crate::types::{AgentEvent, AgentStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Panics on "boom", counts everything else.
    struct FlakyAgent;

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &str {
            "FlakyAgent"
        }

        fn init(&self, _params: &Value) -> Result<AgentState, AgentError> {
            Ok(AgentState::new().with_field("count", json!(0)))
        }

        async fn step(
            &self,
            state: &AgentState,
            event: &AgentEvent,
        ) -> Result<StepOutcome, AgentError> {
            if event.kind == "boom" {
                panic!("boom requested");
            }
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            let mut next = state.clone();
            next.set("count", json!(count + 1));
            Ok(StepOutcome::new(next))
        }
    }

    fn params(
        key: &str,
        monitor: mpsc::UnboundedSender<MonitorEvent>,
        config: SupervisorConfig,
    ) -> SupervisorParams {
        SupervisorParams {
            key: AgentKey::from(key),
            monitor_id: MonitorId::new(),
            agent: Arc::new(FlakyAgent),
            initial_state: AgentState::new().with_field("count", json!(0)),
            runtime_config: RuntimeConfig {
                // One fault escalates straight to a runtime stop, which the
                // supervisor sees as a crash.
                repeated_failure_limit: 1,
                ..RuntimeConfig::default()
            },
            config,
            monitor,
        }
    }

    #[tokio::test]
    async fn crash_restarts_primary_once() {
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let handle = SessionSupervisor::start(params(
            "u1",
            monitor_tx,
            SupervisorConfig::default(),
        ));

        let first = handle.primary();
        first.send(AgentEvent::new("boom", json!({})));

        // Wait for the replacement primary to appear.
        let mut replaced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if handle.primary().is_alive() && !first.is_alive() {
                replaced = true;
                break;
            }
        }
        assert!(replaced, "primary should have been restarted");
        assert!(!handle.is_finished());
        assert!(monitor_rx.try_recv().is_err());

        // The restarted primary works.
        let reply = handle
            .primary()
            .call(AgentEvent::new("tick", json!({})), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.status, AgentStatus::Idle);

        handle.shutdown(false, Duration::from_secs(1)).await.unwrap();
        assert!(handle.wait_exited(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn restart_budget_exhaustion_reports_monitor() {
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let handle = SessionSupervisor::start(params(
            "u2",
            monitor_tx,
            SupervisorConfig {
                max_restarts: 1,
                restart_window: Duration::from_secs(5),
            },
        ));

        // First crash consumes the single restart; second ends the tree.
        let first = handle.primary();
        first.send(AgentEvent::new("boom", json!({})));
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !first.is_alive() && handle.primary().is_alive() {
                break;
            }
        }
        assert!(!first.is_alive(), "first primary should have crashed");
        handle.primary().send(AgentEvent::new("boom", json!({})));

        assert!(handle.wait_exited(Duration::from_secs(2)).await);
        let event = monitor_rx.recv().await.unwrap();
        assert_eq!(event.reason, ExitReason::MaxRestartsExceeded);
        assert_eq!(event.key, AgentKey::from("u2"));
    }

    #[tokio::test]
    async fn kill_reports_killed() {
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let handle = SessionSupervisor::start(params(
            "u3",
            monitor_tx,
            SupervisorConfig::default(),
        ));

        handle.kill();
        assert!(handle.wait_exited(Duration::from_secs(1)).await);
        let event = monitor_rx.recv().await.unwrap();
        assert_eq!(event.reason, ExitReason::Killed);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn clean_shutdown_reports_normal() {
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let handle = SessionSupervisor::start(params(
            "u4",
            monitor_tx,
            SupervisorConfig::default(),
        ));

        handle.shutdown(false, Duration::from_secs(1)).await.unwrap();
        assert!(handle.wait_exited(Duration::from_secs(1)).await);
        let event = monitor_rx.recv().await.unwrap();
        assert_eq!(event.reason, ExitReason::Normal);
    }

    #[tokio::test]
    async fn spawn_and_stop_child() {
        let (monitor_tx, _monitor_rx) = mpsc::unbounded_channel();
        let handle = SessionSupervisor::start(params(
            "u5",
            monitor_tx,
            SupervisorConfig::default(),
        ));

        handle
            .spawn_child(ChildSpec {
                name: "worker".to_string(),
                agent: Arc::new(FlakyAgent),
                initial_state: AgentState::new(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.stop_child("worker").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        handle.shutdown(false, Duration::from_secs(1)).await.unwrap();
        assert!(handle.wait_exited(Duration::from_secs(1)).await);
    }
}
