//! Agent runtime supervisor.
//!
//! Owns every agent's descriptor and lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |           |
//!               +-> Errored <+      (Errored -> Starting on explicit start)
//! ```
//!
//! Each agent has one ownership token (the lifecycle mutex). Start, stop,
//! restart, update, delete and turn submission all take it, so a stop can
//! never interleave with a submission. Accepted turns go onto a bounded
//! queue drained by a single worker task per agent, which keeps turns
//! strictly FIFO with at most one in flight against the execution process.
//! Different agents share nothing but the agent map, so they run fully in
//! parallel.
//!
//! Lifecycle transitions and turns are published on the supervisor's
//! [`EventBus`]: one lifecycle run per launch, one turn run per turn.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::agent::descriptor::{self, AgentDescriptor, AgentPatch, validate_agent_id};
use crate::agent::events::{EventBus, EventStream, RECENT_EVENTS, RunEvents};
use crate::agent::executor::{AgentExecutor, AgentProcess};
use crate::config::{AgentsConfig, ExecutorConfig};
use crate::error::{AgentError, MemoryError};
use crate::memory::compactor::Compactor;
use crate::memory::context::{ContextAssembler, ContextRequest, Peer};
use crate::memory::extractor::ProcedureExtractor;
use crate::memory::global::validate_procedures;
use crate::memory::session::{Session, Turn, ordered_after, sanitize_session_id};
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

/// Session used by `submit_test_message`.
pub const TEST_SESSION: &str = "test";

/// Lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange payload for agent CRUD and status.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub emoji: String,
    pub model: String,
    pub mcp_servers: Vec<String>,
    pub soul: String,
    pub bot_user_id: Option<String>,
    pub enabled: bool,
    pub state: AgentState,
    pub uptime_s: u64,
    pub pending_turns: usize,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create an agent. Blank fields take descriptor defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAgent {
    /// Explicit id; derived from the name when absent.
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub soul: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    pub bot_user_id: Option<String>,
    pub enabled: Option<bool>,
}

impl NewAgent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Resolves once a submitted turn completes, fails or is cancelled.
#[derive(Debug)]
pub struct TurnHandle {
    rx: oneshot::Receiver<Result<String, AgentError>>,
}

impl TurnHandle {
    pub async fn wait(self) -> Result<String, AgentError> {
        // A dropped sender means the worker was torn down before replying.
        self.rx.await.unwrap_or(Err(AgentError::Cancelled))
    }
}

struct QueuedTurn {
    session_id: String,
    text: String,
    /// Run to report under; a fresh turn run when absent.
    events: Option<Arc<RunEvents>>,
    reply: oneshot::Sender<Result<String, AgentError>>,
}

/// Observable runtime state. Updated by lifecycle operations and, for crash
/// detection only, by the worker.
#[derive(Default)]
struct RuntimeCell {
    state: Option<AgentState>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    process: Option<Arc<dyn AgentProcess>>,
}

impl RuntimeCell {
    fn state(&self) -> AgentState {
        self.state.unwrap_or(AgentState::Stopped)
    }

    /// Running agents whose process has died are reported as errored.
    fn reconcile(&mut self, agent_id: &str) -> AgentState {
        if self.state() == AgentState::Running {
            if let Some(process) = &self.process {
                if !process.is_alive() {
                    tracing::error!("Agent {} execution process is no longer alive", agent_id);
                    self.state = Some(AgentState::Errored);
                    self.last_error = Some("execution process exited unexpectedly".to_string());
                }
            }
        }
        self.state()
    }
}

/// Resources owned by a started agent, guarded by the lifecycle token.
#[derive(Default)]
struct Lifecycle {
    queue: Option<mpsc::Sender<QueuedTurn>>,
    worker: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
    /// Lifecycle run of the current launch.
    events: Option<Arc<RunEvents>>,
}

struct AgentSlot {
    descriptor: RwLock<AgentDescriptor>,
    lifecycle: Mutex<Lifecycle>,
    runtime: Arc<Mutex<RuntimeCell>>,
    /// Serialises memory writes with turn and compaction processing.
    memory: Arc<Mutex<()>>,
    pending: Arc<AtomicUsize>,
}

impl AgentSlot {
    fn new(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            lifecycle: Mutex::new(Lifecycle::default()),
            runtime: Arc::new(Mutex::new(RuntimeCell::default())),
            memory: Arc::new(Mutex::new(())),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Timeouts and bounds applied to every agent.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub queue_depth: usize,
    pub launch_timeout: Duration,
    pub turn_timeout: Duration,
    pub stop_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(agents: &AgentsConfig, executor: &ExecutorConfig) -> Self {
        Self {
            queue_depth: agents.queue_depth.max(1),
            launch_timeout: executor.launch_timeout,
            turn_timeout: executor.turn_timeout,
            stop_grace: executor.stop_grace,
        }
    }
}

type AgentMap = HashMap<String, Arc<AgentSlot>>;

/// Supervises all agents.
pub struct Supervisor {
    store: Arc<dyn DocumentStore>,
    executor: Arc<dyn AgentExecutor>,
    assembler: Arc<ContextAssembler>,
    extractor: Arc<ProcedureExtractor>,
    compactor: Compactor,
    settings: SupervisorSettings,
    events: Arc<EventBus>,
    agents: Arc<RwLock<AgentMap>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        executor: Arc<dyn AgentExecutor>,
        agents: &AgentsConfig,
        executor_config: &ExecutorConfig,
    ) -> Self {
        let extractor = Arc::new(ProcedureExtractor::new(store.clone(), agents));
        let assembler = Arc::new(ContextAssembler::new(
            store.clone(),
            extractor.clone(),
            agents,
        ));
        let events = Arc::new(EventBus::new(RECENT_EVENTS).with_store(store.clone()));
        Self {
            store,
            executor,
            assembler,
            extractor,
            compactor: Compactor::from_config(agents, executor_config),
            settings: SupervisorSettings::from_config(agents, executor_config),
            events,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bus carrying every agent's lifecycle and turn events.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Register every stored agent as stopped.
    pub async fn load(&self) -> Result<usize, AgentError> {
        let ids = self.store.list_agents().await?;
        let mut agents = self.agents.write().await;
        for id in ids {
            if agents.contains_key(&id) || !descriptor::is_valid_agent_id(&id) {
                continue;
            }
            match descriptor::load(self.store.as_ref(), &id).await {
                Ok(Some(desc)) => {
                    agents.insert(id, Arc::new(AgentSlot::new(desc)));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable agent {}: {}", id, e),
            }
        }
        tracing::info!("Loaded {} agent(s)", agents.len());
        Ok(agents.len())
    }

    async fn slot(&self, id: &str) -> Result<Arc<AgentSlot>, AgentError> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound { id: id.to_string() })
    }

    // ==================== Descriptor CRUD ====================

    /// Create and persist a new agent. It starts stopped.
    pub async fn create_agent(&self, request: NewAgent) -> Result<AgentRecord, AgentError> {
        let mut agents = self.agents.write().await;
        let taken: HashSet<String> = agents.keys().cloned().collect();

        let id = match request.id.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => {
                validate_agent_id(explicit)?;
                if taken.contains(explicit) {
                    return Err(AgentError::AlreadyExists {
                        id: explicit.to_string(),
                    });
                }
                explicit.to_string()
            }
            _ => descriptor::unique_agent_id(&request.name, &taken)?,
        };

        let mut desc = AgentDescriptor::new(&id, request.name)
            .with_emoji(request.emoji)
            .with_soul(request.soul)
            .with_model(request.model)
            .with_servers(request.mcp_servers);
        desc.bot_user_id = request.bot_user_id;
        desc.enabled = request.enabled.unwrap_or(true);

        let saved = descriptor::save(self.store.as_ref(), desc).await?;
        let slot = Arc::new(AgentSlot::new(saved));
        agents.insert(id.clone(), slot.clone());
        drop(agents);

        tracing::info!("Created agent {}", id);
        Ok(self.record(&slot).await)
    }

    /// Apply a partial update, then stop, start or restart as the change requires.
    pub async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<AgentRecord, AgentError> {
        let slot = self.slot(id).await?;
        let mut lifecycle = slot.lifecycle.lock().await;

        let mut desc = slot.descriptor.read().await.clone();
        let effect = patch.apply(&mut desc);
        let saved = {
            let _memory = slot.memory.lock().await;
            descriptor::save(self.store.as_ref(), desc).await?
        };
        let enabled = saved.enabled;
        *slot.descriptor.write().await = saved;

        let state = slot.runtime.lock().await.reconcile(id);
        let active = matches!(state, AgentState::Running | AgentState::Starting);

        if effect.enabled_changed && !enabled && active {
            self.stop_locked(id, &slot, &mut lifecycle).await;
        } else if effect.enabled_changed && enabled && !active {
            if let Err(e) = self.start_locked(id, &slot, &mut lifecycle).await {
                tracing::warn!("Agent {} enabled but failed to start: {}", id, e);
            }
        } else if effect.execution_changed && active {
            tracing::info!("Agent {} execution settings changed, restarting", id);
            self.stop_locked(id, &slot, &mut lifecycle).await;
            if let Err(e) = self.start_locked(id, &slot, &mut lifecycle).await {
                tracing::warn!("Agent {} failed to restart after update: {}", id, e);
            }
        }
        drop(lifecycle);

        Ok(self.record(&slot).await)
    }

    /// Stop the agent, discard its queue and remove everything stored for it.
    pub async fn delete_agent(&self, id: &str) -> Result<(), AgentError> {
        let slot = self
            .agents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgentError::NotFound { id: id.to_string() })?;

        let mut lifecycle = slot.lifecycle.lock().await;
        self.stop_locked(id, &slot, &mut lifecycle).await;
        let _memory = slot.memory.lock().await;
        self.store.delete_agent(id).await?;

        tracing::info!("Deleted agent {}", id);
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<AgentRecord, AgentError> {
        let slot = self.slot(id).await?;
        Ok(self.record(&slot).await)
    }

    /// All agents, sorted by id.
    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let mut slots: Vec<(String, Arc<AgentSlot>)> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            records.push(self.record(&slot).await);
        }
        records
    }

    /// Current descriptors, for mention resolution.
    pub async fn descriptors(&self) -> Vec<AgentDescriptor> {
        let slots: Vec<Arc<AgentSlot>> = self.agents.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.descriptor.read().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Link the agent to its chat bot identity. A blank id unlinks.
    pub async fn link_agent_bot(&self, id: &str, bot_user_id: &str) -> Result<AgentRecord, AgentError> {
        let bot = bot_user_id.trim();
        let patch = AgentPatch {
            bot_user_id: Some((!bot.is_empty()).then(|| bot.to_string())),
            ..Default::default()
        };
        self.update_agent(id, patch).await
    }

    async fn record(&self, slot: &AgentSlot) -> AgentRecord {
        let desc = slot.descriptor.read().await.clone();
        let (state, started_at, last_error) = {
            let mut cell = slot.runtime.lock().await;
            let state = cell.reconcile(&desc.id);
            (state, cell.started_at, cell.last_error.clone())
        };
        let uptime_s = match (state, started_at) {
            (AgentState::Running, Some(at)) => (Utc::now() - at).num_seconds().max(0) as u64,
            _ => 0,
        };

        AgentRecord {
            id: desc.id,
            name: desc.name,
            emoji: desc.emoji,
            model: desc.model,
            mcp_servers: desc.mcp_servers,
            soul: desc.soul,
            bot_user_id: desc.bot_user_id,
            enabled: desc.enabled,
            state,
            uptime_s,
            pending_turns: slot.pending.load(Ordering::SeqCst),
            last_error,
            created_at: desc.created_at,
            updated_at: desc.updated_at,
        }
    }

    // ==================== Lifecycle ====================

    /// Launch the agent. No-op when already running; fails while a stop is
    /// in progress.
    pub async fn start(&self, id: &str) -> Result<(), AgentError> {
        let slot = self.slot(id).await?;
        if slot.runtime.lock().await.state() == AgentState::Stopping {
            return Err(AgentError::AlreadyTransitioning {
                id: id.to_string(),
                state: AgentState::Stopping.to_string(),
            });
        }
        let mut lifecycle = slot.lifecycle.lock().await;
        self.start_locked(id, &slot, &mut lifecycle).await
    }

    /// Stop the agent, cancelling queued turns. No-op when already stopped.
    pub async fn stop(&self, id: &str) -> Result<(), AgentError> {
        let slot = self.slot(id).await?;
        let mut lifecycle = slot.lifecycle.lock().await;
        self.stop_locked(id, &slot, &mut lifecycle).await;
        Ok(())
    }

    /// Stop then start under one hold of the ownership token.
    pub async fn restart(&self, id: &str) -> Result<(), AgentError> {
        let slot = self.slot(id).await?;
        let mut lifecycle = slot.lifecycle.lock().await;
        self.stop_locked(id, &slot, &mut lifecycle).await;
        self.start_locked(id, &slot, &mut lifecycle).await
    }

    /// Start every enabled agent; failures are recorded per agent.
    pub async fn start_enabled(&self) -> usize {
        let mut started = 0;
        for desc in self.descriptors().await {
            if !desc.enabled {
                continue;
            }
            match self.start(&desc.id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("Agent {} failed to start: {}", desc.id, e),
            }
        }
        started
    }

    /// Stop every agent.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!("Agent {} did not stop cleanly: {}", id, e);
            }
        }
    }

    async fn start_locked(
        &self,
        id: &str,
        slot: &AgentSlot,
        lifecycle: &mut Lifecycle,
    ) -> Result<(), AgentError> {
        let state = slot.runtime.lock().await.reconcile(id);
        match state {
            AgentState::Running | AgentState::Starting => return Ok(()),
            AgentState::Stopping => {
                return Err(AgentError::AlreadyTransitioning {
                    id: id.to_string(),
                    state: state.to_string(),
                });
            }
            AgentState::Errored => {
                // Leftovers from the crashed run.
                self.teardown(id, slot, lifecycle).await;
            }
            AgentState::Stopped => {}
        }

        {
            let mut cell = slot.runtime.lock().await;
            cell.state = Some(AgentState::Starting);
            cell.last_error = None;
        }
        tracing::info!("Starting agent {}", id);

        let desc = slot.descriptor.read().await.clone();
        let run = Arc::new(self.events.run(id, None));
        run.emit(
            EventStream::Lifecycle,
            "agent.starting",
            json!({ "model": desc.model }),
        )
        .await;

        let process = match self
            .executor
            .launch(&desc, self.settings.launch_timeout)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("Agent {} failed to launch: {}", id, e);
                run.emit(
                    EventStream::Lifecycle,
                    "agent.launch_failed",
                    json!({ "error": e.to_string(), "error_kind": e.kind() }),
                )
                .await;
                let mut cell = slot.runtime.lock().await;
                cell.state = Some(AgentState::Errored);
                cell.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.settings.queue_depth);
        let closing = Arc::new(AtomicBool::new(false));
        let worker = TurnWorker {
            agent_id: id.to_string(),
            process: process.clone(),
            store: self.store.clone(),
            assembler: self.assembler.clone(),
            extractor: self.extractor.clone(),
            compactor: self.compactor.clone(),
            memory: slot.memory.clone(),
            runtime: slot.runtime.clone(),
            pending: slot.pending.clone(),
            closing: closing.clone(),
            turn_timeout: self.settings.turn_timeout,
            agents: Arc::downgrade(&self.agents),
            events: self.events.clone(),
            lifecycle_events: run.clone(),
        };

        lifecycle.queue = Some(tx);
        lifecycle.closing = closing;
        lifecycle.worker = Some(tokio::spawn(worker.run(rx)));
        lifecycle.events = Some(run.clone());

        {
            let mut cell = slot.runtime.lock().await;
            cell.state = Some(AgentState::Running);
            cell.started_at = Some(Utc::now());
            cell.process = Some(process);
        }
        run.emit(EventStream::Lifecycle, "agent.started", json!({})).await;
        tracing::info!("Agent {} running", id);
        Ok(())
    }

    async fn stop_locked(&self, id: &str, slot: &AgentSlot, lifecycle: &mut Lifecycle) {
        {
            let mut cell = slot.runtime.lock().await;
            if cell.state() == AgentState::Stopped {
                return;
            }
            cell.state = Some(AgentState::Stopping);
        }
        tracing::info!("Stopping agent {}", id);
        let run = lifecycle.events.clone();
        if let Some(run) = &run {
            run.emit(EventStream::Lifecycle, "agent.stopping", json!({})).await;
        }

        self.teardown(id, slot, lifecycle).await;

        {
            let mut cell = slot.runtime.lock().await;
            cell.state = Some(AgentState::Stopped);
            cell.started_at = None;
            cell.process = None;
        }
        if let Some(run) = &run {
            run.emit(EventStream::Lifecycle, "agent.stopped", json!({})).await;
        }
        tracing::info!("Agent {} stopped", id);
    }

    /// Cancel queued turns, let the in-flight turn finish within the grace
    /// period, then terminate and finally kill the process.
    async fn teardown(&self, id: &str, slot: &AgentSlot, lifecycle: &mut Lifecycle) {
        lifecycle.closing.store(true, Ordering::SeqCst);
        lifecycle.queue = None;
        lifecycle.events = None;
        let process = slot.runtime.lock().await.process.clone();
        let grace = self.settings.stop_grace;

        if let Some(mut worker) = lifecycle.worker.take() {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                tracing::warn!("Agent {} still busy after {:?}, terminating", id, grace);
                if let Some(process) = &process {
                    process.terminate().await;
                }
                if tokio::time::timeout(grace, &mut worker).await.is_err() {
                    tracing::warn!("Agent {} did not exit, killing", id);
                    if let Some(process) = &process {
                        process.kill().await;
                    }
                    worker.abort();
                    let _ = worker.await;
                }
            }
        }

        if let Some(process) = &process {
            process.terminate().await;
        }
        slot.pending.store(0, Ordering::SeqCst);
    }

    // ==================== Turns ====================

    /// Queue a turn. Fails fast when the agent is not running or its queue is full.
    pub async fn submit_turn(
        &self,
        id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<TurnHandle, AgentError> {
        self.submit_turn_with(id, session_id, text, None).await
    }

    /// Queue a turn that reports its events under an existing run.
    pub(crate) async fn submit_turn_with(
        &self,
        id: &str,
        session_id: &str,
        text: &str,
        events: Option<Arc<RunEvents>>,
    ) -> Result<TurnHandle, AgentError> {
        let slot = self.slot(id).await?;
        let lifecycle = slot.lifecycle.lock().await;

        let state = slot.runtime.lock().await.reconcile(id);
        let not_running = || AgentError::NotRunning {
            id: id.to_string(),
            state: state.to_string(),
        };
        if state != AgentState::Running {
            return Err(not_running());
        }
        let queue = lifecycle.queue.as_ref().ok_or_else(not_running)?;

        let depth = self.settings.queue_depth;
        if slot.pending.load(Ordering::SeqCst) >= depth {
            return Err(AgentError::Backpressure {
                id: id.to_string(),
                depth,
            });
        }

        let (reply, rx) = oneshot::channel();
        let turn = QueuedTurn {
            session_id: sanitize_session_id(session_id),
            text: text.to_string(),
            events,
            reply,
        };
        slot.pending.fetch_add(1, Ordering::SeqCst);
        match queue.try_send(turn) {
            Ok(()) => Ok(TurnHandle { rx }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                slot.pending.fetch_sub(1, Ordering::SeqCst);
                Err(AgentError::Backpressure {
                    id: id.to_string(),
                    depth,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                slot.pending.fetch_sub(1, Ordering::SeqCst);
                Err(not_running())
            }
        }
    }

    /// Run one turn in the agent's test session and wait for the reply.
    pub async fn submit_test_message(&self, id: &str, text: &str) -> Result<String, AgentError> {
        self.submit_turn(id, TEST_SESSION, text).await?.wait().await
    }

    // ==================== Agent memory ====================

    pub async fn agent_memory(&self, id: &str) -> Result<String, AgentError> {
        self.slot(id).await?;
        Ok(self
            .store
            .get_document(&Scope::agent(id), DocumentKind::Memory)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_agent_memory(&self, id: &str, text: &str) -> Result<(), AgentError> {
        let slot = self.slot(id).await?;
        let _memory = slot.memory.lock().await;
        self.store
            .put_document(&Scope::agent(id), DocumentKind::Memory, text)
            .await?;
        Ok(())
    }

    pub async fn agent_procedures(&self, id: &str) -> Result<String, AgentError> {
        self.slot(id).await?;
        Ok(self
            .store
            .get_document(&Scope::agent(id), DocumentKind::Procedures)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_agent_procedures(&self, id: &str, text: &str) -> Result<(), AgentError> {
        validate_procedures(text)?;
        let slot = self.slot(id).await?;
        let _memory = slot.memory.lock().await;
        self.store
            .put_document(&Scope::agent(id), DocumentKind::Procedures, text)
            .await?;
        Ok(())
    }

    pub async fn list_sessions(&self, id: &str) -> Result<Vec<String>, AgentError> {
        self.slot(id).await?;
        Ok(self.store.list_sessions(id).await?)
    }

    pub async fn get_session(&self, id: &str, session_id: &str) -> Result<Session, AgentError> {
        self.slot(id).await?;
        let session_id = sanitize_session_id(session_id);
        if !self.store.list_sessions(id).await?.contains(&session_id) {
            return Err(MemoryError::SessionNotFound { id: session_id }.into());
        }
        let turns = self.store.read_session(id, &session_id).await?;
        Ok(Session::new(session_id, turns))
    }
}

/// Drains one agent's queue against its execution process.
struct TurnWorker {
    agent_id: String,
    process: Arc<dyn AgentProcess>,
    store: Arc<dyn DocumentStore>,
    assembler: Arc<ContextAssembler>,
    extractor: Arc<ProcedureExtractor>,
    compactor: Compactor,
    memory: Arc<Mutex<()>>,
    runtime: Arc<Mutex<RuntimeCell>>,
    pending: Arc<AtomicUsize>,
    closing: Arc<AtomicBool>,
    turn_timeout: Duration,
    /// Weak so a running worker never keeps the agent map alive.
    agents: Weak<RwLock<AgentMap>>,
    events: Arc<EventBus>,
    lifecycle_events: Arc<RunEvents>,
}

impl TurnWorker {
    async fn run(self, mut rx: mpsc::Receiver<QueuedTurn>) {
        while let Some(turn) = rx.recv().await {
            if self.closing.load(Ordering::SeqCst) {
                self.finish(turn, Err(AgentError::Cancelled));
                continue;
            }

            let run = match &turn.events {
                Some(run) => run.clone(),
                None => Arc::new(self.events.run(&self.agent_id, Some(turn.session_id.as_str()))),
            };
            run.emit(
                EventStream::Turn,
                "turn.assigned",
                json!({ "prompt_length": turn.text.chars().count() }),
            )
            .await;
            let started = std::time::Instant::now();

            let result = self.process_turn(&turn, &run).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let completed = match &result {
                Ok(reply) => json!({
                    "status": "completed",
                    "reply_length": reply.chars().count(),
                    "duration_ms": duration_ms,
                }),
                Err(e) => json!({
                    "status": "failed",
                    "error": e.to_string(),
                    "error_kind": e.kind(),
                    "duration_ms": duration_ms,
                }),
            };
            run.emit(EventStream::Turn, "turn.completed", completed).await;

            let fatal = match &result {
                Err(e) if e.is_fatal() => Some(e.to_string()),
                _ => None,
            };
            let Some(reason) = fatal else {
                self.finish(turn, result);
                continue;
            };

            // Record the crash before the caller sees the failed turn.
            self.mark_errored(reason).await;
            self.finish(turn, result);
            rx.close();
            while let Some(rest) = rx.recv().await {
                self.finish(rest, Err(AgentError::Cancelled));
            }
            break;
        }
        tracing::debug!("Agent {} worker exited", self.agent_id);
    }

    fn finish(&self, turn: QueuedTurn, result: Result<String, AgentError>) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let _ = turn.reply.send(result);
    }

    async fn mark_errored(&self, reason: String) {
        {
            let mut cell = self.runtime.lock().await;
            if cell.state() != AgentState::Running {
                return;
            }
            tracing::error!("Agent {} crashed: {}", self.agent_id, reason);
            cell.state = Some(AgentState::Errored);
            cell.last_error = Some(reason.clone());
        }
        self.lifecycle_events
            .emit(EventStream::Lifecycle, "agent.crashed", json!({ "reason": reason }))
            .await;
    }

    /// Enabled agents other than this one, for the delegation layer.
    async fn peers(&self) -> Vec<Peer> {
        let Some(agents) = self.agents.upgrade() else {
            return Vec::new();
        };
        let slots: Vec<Arc<AgentSlot>> = agents.read().await.values().cloned().collect();
        let mut peers = Vec::new();
        for slot in slots {
            let desc = slot.descriptor.read().await;
            if desc.enabled && desc.id != self.agent_id {
                peers.push(Peer {
                    id: desc.id.clone(),
                    description: desc.summary(),
                });
            }
        }
        peers
    }

    async fn process_turn(&self, turn: &QueuedTurn, run: &RunEvents) -> Result<String, AgentError> {
        if !self.process.is_alive() {
            return Err(AgentError::SubprocessCrash {
                reason: "execution process exited".to_string(),
            });
        }

        let peers = self.peers().await;
        let (context, last) = {
            let _memory = self.memory.lock().await;
            let turns = match self.store.read_session(&self.agent_id, &turn.session_id).await {
                Ok(turns) => turns,
                Err(e) => {
                    tracing::warn!(
                        "Agent {} could not read session {}: {}",
                        self.agent_id,
                        turn.session_id,
                        e
                    );
                    Vec::new()
                }
            };
            let session = Session::new(turn.session_id.clone(), turns);
            let context = self
                .assembler
                .assemble(&ContextRequest {
                    agent_id: &self.agent_id,
                    session: &session,
                    user_text: &turn.text,
                    peers: &peers,
                })
                .await;
            (context, session.turns.last().cloned())
        };

        let human = ordered_after(last.as_ref(), Turn::human(&turn.text));
        let reply = self
            .process
            .run_turn(&context, &turn.text, self.turn_timeout)
            .await?;
        let agent = ordered_after(Some(&human), Turn::agent(&reply));

        let _memory = self.memory.lock().await;
        if let Err(e) = self
            .store
            .append_turns(&self.agent_id, &turn.session_id, &[human, agent])
            .await
        {
            tracing::error!(
                "Agent {} failed to record turn in {}: {}",
                self.agent_id,
                turn.session_id,
                e
            );
            return Ok(reply);
        }

        self.after_turn(&turn.session_id, run).await;
        Ok(reply)
    }

    /// Compaction and procedure learning. Failures never fail the turn.
    async fn after_turn(&self, session_id: &str, run: &RunEvents) {
        let compaction = match self
            .compactor
            .maybe_compact(
                self.store.as_ref(),
                &self.agent_id,
                session_id,
                self.process.as_ref(),
            )
            .await
        {
            Ok(Some(compaction)) => compaction,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Compaction failed for {}/{}: {}", self.agent_id, session_id, e);
                return;
            }
        };

        run.emit(
            EventStream::Turn,
            "memory.compacted",
            json!({
                "compacted_turns": compaction.compacted.len(),
                "remaining": compaction.remaining,
            }),
        )
        .await;

        let today = Utc::now().date_naive();
        if let Err(e) = self
            .extractor
            .learn(&Scope::agent(&self.agent_id), &compaction.compacted, today)
            .await
        {
            tracing::warn!("Procedure extraction failed for {}: {}", self.agent_id, e);
        }
    }
}
