//! Service facade.
//!
//! Wires the store, supervisor, delegation, global memory and chat bridge
//! together and exposes the operations the CLI (or any route layer) calls.

use std::sync::Arc;

use crate::agent::delegation::{DelegationRequest, DelegationRun, Delegator};
use crate::agent::descriptor::AgentPatch;
use crate::agent::events::{AgentEvent, EventBus, EventStream};
use crate::agent::executor::{AgentExecutor, CliExecutor};
use crate::agent::supervisor::{AgentRecord, NewAgent, Supervisor};
use crate::chat::bridge::{BridgeStatus, ChatBridge};
use crate::chat::surface::{ChatSurface, HttpChatSurface};
use crate::config::Config;
use crate::error::{AgentError, ChatError};
use crate::memory::global::GlobalMemory;
use crate::memory::session::Session;
use crate::memory::store::{DocumentStore, FileStore};

pub struct Troupe {
    config: Config,
    supervisor: Arc<Supervisor>,
    delegator: Delegator,
    global: GlobalMemory,
    bridge: Option<Arc<ChatBridge>>,
}

impl Troupe {
    /// Open the on-disk store under the configured data directory and use
    /// the command-line executor. The bridge is wired only when the chat
    /// surface is fully configured.
    pub async fn open(config: Config) -> Result<Self, AgentError> {
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(config.agents.data_dir.clone()));
        let executor: Arc<dyn AgentExecutor> =
            Arc::new(CliExecutor::new(config.executor.clone()));
        let surface: Option<Arc<dyn ChatSurface>> = match HttpChatSurface::new(&config.chat) {
            Ok(surface) => Some(Arc::new(surface)),
            Err(e) => {
                tracing::debug!("Chat bridge unavailable: {}", e);
                None
            }
        };
        Self::with_parts(config, store, executor, surface).await
    }

    pub async fn with_parts(
        config: Config,
        store: Arc<dyn DocumentStore>,
        executor: Arc<dyn AgentExecutor>,
        surface: Option<Arc<dyn ChatSurface>>,
    ) -> Result<Self, AgentError> {
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            executor,
            &config.agents,
            &config.executor,
        ));
        supervisor.load().await?;

        let delegator = Delegator::open(
            supervisor.clone(),
            store.clone(),
            config.agents.delegation_timeout,
        )
        .await?;
        let expired = delegator.sweep().await;
        if !expired.is_empty() {
            tracing::info!("Timed out {} stale delegation run(s)", expired.len());
        }

        let bridge = match surface {
            Some(surface) => Some(Arc::new(
                ChatBridge::open(
                    supervisor.clone(),
                    surface,
                    store.clone(),
                    config.chat.clone(),
                )
                .await?,
            )),
            None => None,
        };

        Ok(Self {
            global: GlobalMemory::new(store),
            supervisor,
            delegator,
            bridge,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Agents ====================

    pub async fn create_agent(&self, request: NewAgent) -> Result<AgentRecord, AgentError> {
        self.supervisor.create_agent(request).await
    }

    pub async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<AgentRecord, AgentError> {
        self.supervisor.update_agent(id, patch).await
    }

    pub async fn delete_agent(&self, id: &str) -> Result<(), AgentError> {
        self.supervisor.delete_agent(id).await
    }

    pub async fn get_agent(&self, id: &str) -> Result<AgentRecord, AgentError> {
        self.supervisor.get_agent(id).await
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        self.supervisor.list_agents().await
    }

    pub async fn start_agent(&self, id: &str) -> Result<(), AgentError> {
        self.supervisor.start(id).await
    }

    pub async fn stop_agent(&self, id: &str) -> Result<(), AgentError> {
        self.supervisor.stop(id).await
    }

    pub async fn restart_agent(&self, id: &str) -> Result<(), AgentError> {
        self.supervisor.restart(id).await
    }

    pub async fn submit_test_message(&self, id: &str, text: &str) -> Result<String, AgentError> {
        self.supervisor.submit_test_message(id, text).await
    }

    pub async fn link_agent_bot(&self, id: &str, bot_user_id: &str) -> Result<AgentRecord, AgentError> {
        self.supervisor.link_agent_bot(id, bot_user_id).await
    }

    // ==================== Memory ====================

    pub async fn get_agent_memory(&self, id: &str) -> Result<String, AgentError> {
        self.supervisor.agent_memory(id).await
    }

    pub async fn update_agent_memory(&self, id: &str, text: &str) -> Result<(), AgentError> {
        self.supervisor.update_agent_memory(id, text).await
    }

    pub async fn get_agent_procedures(&self, id: &str) -> Result<String, AgentError> {
        self.supervisor.agent_procedures(id).await
    }

    pub async fn update_agent_procedures(&self, id: &str, text: &str) -> Result<(), AgentError> {
        self.supervisor.update_agent_procedures(id, text).await
    }

    pub async fn list_sessions(&self, id: &str) -> Result<Vec<String>, AgentError> {
        self.supervisor.list_sessions(id).await
    }

    pub async fn get_session(&self, id: &str, session_id: &str) -> Result<Session, AgentError> {
        self.supervisor.get_session(id, session_id).await
    }

    pub async fn get_global_user_memory(&self) -> Result<String, AgentError> {
        Ok(self.global.user_memory().await?)
    }

    pub async fn update_global_user_memory(&self, text: &str) -> Result<(), AgentError> {
        Ok(self.global.set_user_memory(text).await?)
    }

    pub async fn get_global_procedures(&self) -> Result<String, AgentError> {
        Ok(self.global.procedures().await?)
    }

    pub async fn update_global_procedures(&self, text: &str) -> Result<(), AgentError> {
        Ok(self.global.set_procedures(text).await?)
    }

    pub async fn list_global_knowledge(&self) -> Result<Vec<String>, AgentError> {
        Ok(self.global.list_knowledge().await?)
    }

    // ==================== Delegation and events ====================

    /// Run a task on another agent and wait for the outcome.
    pub async fn delegate(&self, request: DelegationRequest) -> Result<DelegationRun, AgentError> {
        self.delegator.delegate(request).await
    }

    pub async fn get_delegation_run(&self, run_id: &str) -> Result<DelegationRun, AgentError> {
        self.delegator.get_run(run_id).await
    }

    pub async fn list_delegation_runs(&self, parent: Option<&str>) -> Vec<DelegationRun> {
        self.delegator.list_runs(parent).await
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.supervisor.events()
    }

    /// Events buffered by this process.
    pub async fn recent_events(
        &self,
        agent_id: Option<&str>,
        stream: Option<EventStream>,
        limit: usize,
    ) -> Vec<AgentEvent> {
        self.supervisor.events().recent(agent_id, stream, limit).await
    }

    /// The agent's persisted event log, newest `limit` entries.
    pub async fn agent_event_history(&self, id: &str, limit: usize) -> Result<Vec<AgentEvent>, AgentError> {
        self.supervisor.get_agent(id).await?;
        Ok(self.supervisor.events().history(id, limit).await?)
    }

    // ==================== Bridge ====================

    pub async fn start_bridge(&self) -> Result<(), AgentError> {
        let bridge = self.bridge.as_ref().ok_or_else(|| ChatError::NotConfigured {
            reason: "set TROUPE_CHAT_BASE_URL, TROUPE_CHAT_TOKEN and TROUPE_CHAT_SPACE_ID"
                .to_string(),
        })?;
        bridge.start().await?;
        tracing::info!("Chat bridge started");
        Ok(())
    }

    pub async fn stop_bridge(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.stop().await;
        }
    }

    pub async fn bridge_status(&self) -> BridgeStatus {
        match &self.bridge {
            Some(bridge) => bridge.status().await,
            None => BridgeStatus::unconfigured(&self.config.chat),
        }
    }

    // ==================== Service lifecycle ====================

    /// Start enabled agents, then the bridge when enabled. Returns the
    /// number of agents started.
    pub async fn start(&self) -> usize {
        let started = self.supervisor.start_enabled().await;
        tracing::info!("Started {} agent(s)", started);
        if self.config.chat.enabled {
            if let Err(e) = self.start_bridge().await {
                tracing::error!("Chat bridge failed to start: {}", e);
            }
        }
        started
    }

    /// Stop the bridge, then every agent.
    pub async fn shutdown(&self) {
        self.stop_bridge().await;
        self.supervisor.shutdown().await;
        tracing::info!("All agents stopped");
    }
}
