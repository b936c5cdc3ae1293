//! Single-agent event loop
//!
//! Each [`AgentRuntime`] runs exactly one agent: it owns the in-memory
//! [`AgentState`], processes a FIFO inbox of events one at a time, and
//! invokes the user-provided [`Agent::step`] hook to compute the next
//! state, output events, and directives. Runtimes are independent tasks;
//! state is never shared between them, only owned by the loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec;
use crate::journal::Journal;
use crate::store::{CheckpointKey, Store};
use crate::supervisor::SupervisorCommand;
use crate::types::{
    now_ms, AgentError, AgentEvent, AgentState, AgentStatus, CallReply, Entry, EventId,
    StatusMachine, StopReason,
};

pub mod cron;

use cron::CronJobs;

/// The three hooks an agent module provides.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Module name; used to namespace checkpoint keys.
    fn name(&self) -> &str;

    /// Build the initial state for a fresh (non-thawed) instance.
    fn init(&self, params: &Value) -> Result<AgentState, AgentError>;

    /// Process one event: compute the next state, output events, and
    /// directives. The state seen here is exactly the state left by the
    /// previous invocation.
    async fn step(&self, state: &AgentState, event: &AgentEvent) -> Result<StepOutcome, AgentError>;

    /// Optional termination hook, invoked on orderly stop.
    async fn on_stop(&self, _state: &AgentState, _reason: &StopReason) {}
}

/// Result of one step invocation.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub state: AgentState,
    pub events: Vec<AgentEvent>,
    pub directives: Vec<Directive>,
}

impl StepOutcome {
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            events: Vec::new(),
            directives: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: AgentEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }
}

/// Side effects a step may request, applied in order after the step.
#[derive(Clone)]
pub enum Directive {
    /// Deliver an event to the parent runtime, if any.
    EmitToParent(AgentEvent),
    /// Deliver an event to a specific runtime.
    EmitTo(RuntimeHandle, AgentEvent),
    /// Ask the owning supervisor to start a child runtime.
    SpawnChild(ChildSpec),
    /// Ask the owning supervisor to stop a child runtime.
    StopChild(String),
    /// Stop this runtime after the current event.
    StopSelf(StopReason),
    /// Merge fields into the new state.
    SetFields(Map<String, Value>),
    /// Remove a field (dotted path) from the new state.
    DeleteField(String),
    /// Register or replace a recurring job that sends `message` to this
    /// runtime on each cron fire. Re-using a `job_id` cancels the prior
    /// timer first.
    ScheduleCron {
        job_id: String,
        expression: String,
        message: AgentEvent,
        timezone: Option<String>,
    },
    /// Cancel a previously scheduled cron job.
    CancelCron(String),
}

impl std::fmt::Debug for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::EmitToParent(e) => write!(f, "EmitToParent({})", e.kind),
            Directive::EmitTo(handle, e) => write!(f, "EmitTo({}, {})", handle.id(), e.kind),
            Directive::SpawnChild(spec) => write!(f, "SpawnChild({})", spec.name),
            Directive::StopChild(name) => write!(f, "StopChild({})", name),
            Directive::StopSelf(reason) => write!(f, "StopSelf({})", reason),
            Directive::SetFields(fields) => write!(f, "SetFields({} fields)", fields.len()),
            Directive::DeleteField(path) => write!(f, "DeleteField({})", path),
            Directive::ScheduleCron { job_id, expression, .. } => {
                write!(f, "ScheduleCron({}, {})", job_id, expression)
            }
            Directive::CancelCron(job_id) => write!(f, "CancelCron({})", job_id),
        }
    }
}

/// Blueprint for a child runtime spawned under the same supervisor.
#[derive(Clone)]
pub struct ChildSpec {
    pub name: String,
    pub agent: Arc<dyn Agent>,
    pub initial_state: AgentState,
}

impl std::fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpec")
            .field("name", &self.name)
            .field("agent", &self.agent.name())
            .finish()
    }
}

/// Where a runtime persists its checkpoint on hibernation.
#[derive(Clone)]
pub struct RuntimePersistence {
    pub store: Arc<dyn Store>,
    pub key: CheckpointKey,
}

/// Per-runtime configuration.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Steps slower than this are logged as slow.
    pub slow_step_threshold: Duration,
    /// Consecutive faults of the same event kind before the runtime stops.
    pub repeated_failure_limit: u32,
    /// Window within which consecutive faults count toward the limit.
    pub repeated_failure_window: Duration,
    /// DLQ sink for faulted events.
    pub journal: Option<Arc<Journal>>,
    /// Checkpoint destination for hibernation.
    pub persistence: Option<RuntimePersistence>,
    /// Gzip checkpoint bodies.
    pub compress_checkpoints: bool,
    /// Optional sink receiving output events of fire-and-forget steps.
    pub output_tap: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            slow_step_threshold: Duration::from_secs(1),
            repeated_failure_limit: 3,
            repeated_failure_window: Duration::from_secs(30),
            journal: None,
            persistence: None,
            compress_checkpoints: false,
            output_tap: None,
        }
    }
}

/// Links a runtime to its surroundings.
#[derive(Clone, Default)]
pub struct RuntimeContext {
    /// Parent runtime for `EmitToParent` directives.
    pub parent: Option<RuntimeHandle>,
    /// Owning supervisor for spawn/stop-child directives.
    pub supervisor: Option<mpsc::UnboundedSender<SupervisorCommand>>,
}

/// How a runtime loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// Orderly stop or inbox closure.
    Clean,
    /// State was frozen to the store and the loop exited.
    Hibernated,
    /// The loop gave up (for example after repeated step failures).
    Failed(String),
}

pub(crate) enum Inbox {
    Event(AgentEvent),
    Call {
        event: AgentEvent,
        reply: oneshot::Sender<Result<CallReply, AgentError>>,
    },
    Hibernate {
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Stop {
        reason: StopReason,
        reply: Option<oneshot::Sender<()>>,
    },
    AwaitSettled {
        reply: oneshot::Sender<AgentStatus>,
    },
}

/// Cheap, cloneable reference to a running agent loop.
#[derive(Clone)]
pub struct RuntimeHandle {
    id: String,
    sender: mpsc::UnboundedSender<Inbox>,
    status: Arc<RwLock<AgentStatus>>,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl RuntimeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status snapshot.
    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Whether the loop is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Non-blocking enqueue. Delivery to a dead runtime is best-effort:
    /// the event is logged and discarded.
    pub fn send(&self, event: AgentEvent) {
        if let Err(e) = self.sender.send(Inbox::Event(event)) {
            if let Inbox::Event(event) = e.0 {
                tracing::warn!(
                    "Dropping event {} for dead runtime {}",
                    event.kind,
                    self.id
                );
            }
        }
    }

    /// Synchronous round-trip: the event is processed in inbox order and
    /// the step's status and output events are returned.
    pub async fn call(
        &self,
        event: AgentEvent,
        timeout: Duration,
    ) -> Result<CallReply, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Inbox::Call { event, reply: tx })
            .map_err(|_| AgentError::NotFound)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(AgentError::NotFound),
            Err(_) => Err(AgentError::Timeout),
        }
    }

    /// Freeze state to the store, transition to terminated, and stop.
    pub async fn hibernate(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Inbox::Hibernate { reply: tx })
            .map_err(|_| AgentError::NotFound)?;
        rx.await.map_err(|_| AgentError::NotFound)?
    }

    /// Graceful stop, running the agent's termination hook. Stopping an
    /// already-dead runtime is success.
    pub async fn stop(&self, reason: StopReason) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Inbox::Stop {
                reason,
                reply: Some(tx),
            })
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Wait until the runtime settles into `completed` or `failed`.
    pub async fn await_settled(&self, timeout: Duration) -> Result<AgentStatus, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Inbox::AwaitSettled { reply: tx })
            .map_err(|_| AgentError::NotFound)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(AgentError::NotFound),
            Err(_) => Err(AgentError::Timeout),
        }
    }
}

/// Entry point for starting agent loops.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Spawn the event loop for one agent. The returned join handle yields
    /// the loop's [`RunExit`]; the supervisor watches it.
    pub fn start(
        id: impl Into<String>,
        agent: Arc<dyn Agent>,
        mut initial_state: AgentState,
        config: RuntimeConfig,
        context: RuntimeContext,
    ) -> (RuntimeHandle, JoinHandle<RunExit>) {
        let id = id.into();
        // A freshly started (or thawed) runtime always begins idle.
        if initial_state.status != AgentStatus::Idle {
            tracing::debug!(
                "Runtime {} resetting initial status {} to idle",
                id,
                initial_state.status
            );
            initial_state.status = AgentStatus::Idle;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(AgentStatus::Idle));
        let handle = RuntimeHandle {
            id: id.clone(),
            sender: tx.clone(),
            status: status.clone(),
        };

        let run = RuntimeLoop {
            id,
            agent,
            state: initial_state,
            machine: StatusMachine::new(),
            config,
            context,
            inbox: rx,
            // Weak: the loop must not keep its own inbox alive, or dropping
            // every handle would never close the channel.
            self_sender: tx.downgrade(),
            shared_status: status,
            cron: CronJobs::new(),
            awaiters: Vec::new(),
            fault_window: None,
        };
        let join = tokio::spawn(run.run());
        (handle, join)
    }
}

struct FaultWindow {
    kind: String,
    count: u32,
    since: Instant,
}

struct RuntimeLoop {
    id: String,
    agent: Arc<dyn Agent>,
    state: AgentState,
    machine: StatusMachine,
    config: RuntimeConfig,
    context: RuntimeContext,
    inbox: mpsc::UnboundedReceiver<Inbox>,
    self_sender: mpsc::WeakUnboundedSender<Inbox>,
    shared_status: Arc<RwLock<AgentStatus>>,
    cron: CronJobs,
    awaiters: Vec<oneshot::Sender<AgentStatus>>,
    fault_window: Option<FaultWindow>,
}

impl RuntimeLoop {
    async fn run(mut self) -> RunExit {
        loop {
            let message = match self.inbox.recv().await {
                Some(message) => message,
                None => {
                    // Every handle dropped: orderly teardown.
                    self.shutdown(&StopReason::Normal).await;
                    return RunExit::Clean;
                }
            };

            match message {
                Inbox::Event(event) => match self.process_event(&event).await {
                    Ok(ProcessOutcome::Continue(events)) => self.tap_outputs(events),
                    Ok(ProcessOutcome::Exit(exit)) => return exit,
                    Err(e) => {
                        tracing::error!("Runtime {}: event {} rejected: {}", self.id, event.kind, e)
                    }
                },
                Inbox::Call { event, reply } => match self.process_event(&event).await {
                    Ok(ProcessOutcome::Continue(events)) => {
                        let _ = reply.send(Ok(CallReply {
                            status: self.state.status,
                            events,
                        }));
                    }
                    Ok(ProcessOutcome::Exit(exit)) => {
                        let _ = reply.send(Ok(CallReply {
                            status: self.state.status,
                            events: Vec::new(),
                        }));
                        return exit;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Inbox::Hibernate { reply } => match self.do_hibernate().await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        self.cron.clear();
                        return RunExit::Hibernated;
                    }
                    Err(e) => {
                        tracing::warn!("Runtime {}: hibernate failed: {}", self.id, e);
                        let _ = reply.send(Err(e));
                    }
                },
                Inbox::Stop { reason, reply } => {
                    self.shutdown(&reason).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return match reason {
                        StopReason::RepeatedFailure => {
                            RunExit::Failed(StopReason::RepeatedFailure.to_string())
                        }
                        StopReason::Killed => RunExit::Failed(StopReason::Killed.to_string()),
                        _ => RunExit::Clean,
                    };
                }
                Inbox::AwaitSettled { reply } => {
                    if self.state.status.is_settled() {
                        let _ = reply.send(self.state.status);
                    } else {
                        self.awaiters.push(reply);
                    }
                }
            }
        }
    }

    /// Process one event through the step hook, apply directives, and
    /// replace the state.
    async fn process_event(&mut self, event: &AgentEvent) -> Result<ProcessOutcome, AgentError> {
        let started = Instant::now();

        let stepped = AssertUnwindSafe(self.agent.step(&self.state, event))
            .catch_unwind()
            .await;

        let outcome = match stepped {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                return Ok(self.fault(event, e.to_string(), "step_error").await);
            }
            Err(panic) => {
                let message = panic_message(panic);
                return Ok(self.fault(event, message, "step_panic").await);
            }
        };

        let from = self.state.status;
        let to = outcome.state.status;
        if !self.machine.is_valid_transition(from, to) {
            tracing::error!(
                "Runtime {}: step for {} attempted illegal transition {} -> {}",
                self.id,
                event.kind,
                from,
                to
            );
            return Err(AgentError::IllegalTransition { from, to });
        }

        let mut next = outcome.state;
        let mut pending_stop = None;
        for directive in outcome.directives {
            match directive {
                Directive::EmitToParent(event) => match &self.context.parent {
                    Some(parent) => parent.send(event),
                    None => tracing::warn!(
                        "Runtime {}: EmitToParent with no parent configured",
                        self.id
                    ),
                },
                Directive::EmitTo(target, event) => target.send(event),
                Directive::SpawnChild(spec) => self.forward_to_supervisor(
                    SupervisorCommand::SpawnChild(spec),
                    "SpawnChild",
                ),
                Directive::StopChild(name) => self.forward_to_supervisor(
                    SupervisorCommand::StopChild(name),
                    "StopChild",
                ),
                Directive::StopSelf(reason) => pending_stop = Some(reason),
                Directive::SetFields(fields) => next.merge(fields),
                Directive::DeleteField(path) => {
                    next.remove_path(&path);
                }
                Directive::ScheduleCron {
                    job_id,
                    expression,
                    message,
                    timezone,
                } => {
                    if let Err(e) = self.cron.install(
                        &self.id,
                        &job_id,
                        &expression,
                        timezone.as_deref(),
                        message,
                        self.self_sender.clone(),
                    ) {
                        tracing::error!(
                            "Runtime {}: rejecting cron directive {}: {}",
                            self.id,
                            job_id,
                            e
                        );
                    }
                }
                Directive::CancelCron(job_id) => {
                    if !self.cron.cancel(&job_id) {
                        tracing::debug!(
                            "Runtime {}: cancel for unknown cron job {}",
                            self.id,
                            job_id
                        );
                    }
                }
            }
        }

        self.replace_state(next);
        self.fault_window = None;

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_step_threshold {
            tracing::warn!(
                "Runtime {}: slow event {} took {:?}",
                self.id,
                event.kind,
                elapsed
            );
        }

        if let Some(reason) = pending_stop {
            self.shutdown(&reason).await;
            return Ok(ProcessOutcome::Exit(RunExit::Clean));
        }
        Ok(ProcessOutcome::Continue(outcome.events))
    }

    /// A step fault: record the failure, park the event, and either keep
    /// going or give up after too many consecutive faults of one kind.
    async fn fault(&mut self, event: &AgentEvent, message: String, reason: &str) -> ProcessOutcome {
        tracing::error!(
            "Runtime {}: step fault on {} ({}): {}",
            self.id,
            event.kind,
            reason,
            message
        );

        // The fault path forces `failed` directly; the transition table
        // only constrains statuses chosen by the step hook.
        self.state.error = Some(message);
        self.state.status = AgentStatus::Failed;
        *self.shared_status.write() = AgentStatus::Failed;
        self.notify_awaiters();

        if let Some(journal) = &self.config.journal {
            journal.dlq_put(&self.id, entry_from_event(event), reason);
        }

        let escalate = match &mut self.fault_window {
            Some(window)
                if window.kind == event.kind
                    && window.since.elapsed() < self.config.repeated_failure_window =>
            {
                window.count += 1;
                window.count >= self.config.repeated_failure_limit
            }
            _ => {
                self.fault_window = Some(FaultWindow {
                    kind: event.kind.clone(),
                    count: 1,
                    since: Instant::now(),
                });
                self.config.repeated_failure_limit <= 1
            }
        };

        if escalate {
            tracing::error!(
                "Runtime {}: {} consecutive faults on {}, stopping",
                self.id,
                self.config.repeated_failure_limit,
                event.kind
            );
            self.shutdown(&StopReason::RepeatedFailure).await;
            return ProcessOutcome::Exit(RunExit::Failed(
                StopReason::RepeatedFailure.to_string(),
            ));
        }
        ProcessOutcome::Continue(Vec::new())
    }

    async fn do_hibernate(&mut self) -> Result<(), AgentError> {
        if self.state.status == AgentStatus::Terminated {
            return Err(AgentError::IllegalTransition {
                from: AgentStatus::Terminated,
                to: AgentStatus::Terminating,
            });
        }

        if let Some(persistence) = &self.config.persistence {
            let blob = codec::encode_checkpoint(&self.state, self.config.compress_checkpoints)?;
            persistence.store.put_checkpoint(&persistence.key, &blob).await?;
            tracing::debug!(
                "Runtime {}: checkpoint written under {}",
                self.id,
                persistence.key
            );
        }

        self.state.status = AgentStatus::Terminated;
        *self.shared_status.write() = AgentStatus::Terminated;
        Ok(())
    }

    /// Orderly teardown: termination hook, cron cancellation, final status.
    async fn shutdown(&mut self, reason: &StopReason) {
        self.cron.clear();
        let hook = AssertUnwindSafe(self.agent.on_stop(&self.state, reason))
            .catch_unwind()
            .await;
        if hook.is_err() {
            tracing::error!("Runtime {}: termination hook panicked", self.id);
        }
        self.state.status = AgentStatus::Terminated;
        *self.shared_status.write() = AgentStatus::Terminated;
        tracing::debug!("Runtime {} stopped ({})", self.id, reason);
    }

    fn replace_state(&mut self, next: AgentState) {
        let settled = next.status.is_settled();
        *self.shared_status.write() = next.status;
        self.state = next;
        if settled {
            self.notify_awaiters();
        }
    }

    fn notify_awaiters(&mut self) {
        for awaiter in self.awaiters.drain(..) {
            let _ = awaiter.send(self.state.status);
        }
    }

    fn forward_to_supervisor(&self, command: SupervisorCommand, what: &str) {
        match &self.context.supervisor {
            Some(supervisor) => {
                if supervisor.send(command).is_err() {
                    tracing::warn!("Runtime {}: supervisor gone, dropping {}", self.id, what);
                }
            }
            None => tracing::warn!(
                "Runtime {}: {} directive with no supervisor configured",
                self.id,
                what
            ),
        }
    }

    fn tap_outputs(&self, events: Vec<AgentEvent>) {
        if events.is_empty() {
            return;
        }
        match &self.config.output_tap {
            Some(tap) => {
                for event in events {
                    let _ = tap.send(event);
                }
            }
            None => tracing::debug!(
                "Runtime {}: {} output events with no tap configured",
                self.id,
                events.len()
            ),
        }
    }
}

enum ProcessOutcome {
    Continue(Vec<AgentEvent>),
    Exit(RunExit),
}

fn entry_from_event(event: &AgentEvent) -> Entry {
    Entry {
        id: event.id.to_string(),
        seq: 0,
        at: now_ms(),
        kind: event.kind.clone(),
        payload: event.payload.clone(),
        refs: HashMap::new(),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Clone-and-restamp: each cron fire delivers a distinct event id.
pub(crate) fn fresh_event(mut event: AgentEvent) -> AgentEvent {
    event.id = EventId::new();
    event
}
