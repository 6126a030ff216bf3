//! Prompt context assembly.
//!
//! Each turn's context is built from a fixed, ordered list of layers:
//! global procedures, the user preferences note, the agent persona, the
//! agents it may delegate to, the agent memory note, the agent's procedures,
//! the session's compaction summary and finally the recent raw turns of the
//! session. Every layer is always evaluated; a missing or unreadable
//! document contributes nothing. When the result exceeds the budget the
//! oldest text (the start of the context) is cut first.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::AgentsConfig;
use crate::memory::extractor::ProcedureExtractor;
use crate::memory::procedures::{self, MATCH_LIMIT, Procedure};
use crate::memory::session::Session;
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

/// One context layer, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    GlobalProcedures,
    UserPreferences,
    Persona,
    Peers,
    AgentMemory,
    AgentProcedures,
    CompactionSummary,
    RecentConversation,
}

impl Layer {
    pub const ORDER: [Layer; 8] = [
        Layer::GlobalProcedures,
        Layer::UserPreferences,
        Layer::Persona,
        Layer::Peers,
        Layer::AgentMemory,
        Layer::AgentProcedures,
        Layer::CompactionSummary,
        Layer::RecentConversation,
    ];

    pub fn heading(&self) -> &'static str {
        match self {
            Layer::GlobalProcedures => "# Global Procedures",
            Layer::UserPreferences => "# User Preferences",
            Layer::Persona => "# Agent Persona",
            Layer::Peers => "# Available Agents for Delegation",
            Layer::AgentMemory => "# Agent Memory",
            Layer::AgentProcedures => "# Agent Procedures",
            Layer::CompactionSummary => "# Compaction Summary",
            Layer::RecentConversation => "# Recent Conversation",
        }
    }
}

/// Another agent this one can hand work to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub description: String,
}

/// Inputs for assembling one turn's context.
pub struct ContextRequest<'a> {
    pub agent_id: &'a str,
    /// Session transcript after any compaction.
    pub session: &'a Session,
    /// The new human text, used to pick relevant procedures.
    pub user_text: &'a str,
    /// Enabled agents other than this one.
    pub peers: &'a [Peer],
}

/// Builds bounded prompt context from the memory layers.
pub struct ContextAssembler {
    store: Arc<dyn DocumentStore>,
    extractor: Arc<ProcedureExtractor>,
    recent_turns: usize,
    budget_chars: usize,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        extractor: Arc<ProcedureExtractor>,
        config: &AgentsConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            recent_turns: config.context_messages,
            budget_chars: config.context_budget_chars,
        }
    }

    /// Assemble the context. Never fails; the result is at most the budget.
    pub async fn assemble(&self, request: &ContextRequest<'_>) -> String {
        let today = chrono::Utc::now().date_naive();
        let mut sections = Vec::new();
        for layer in Layer::ORDER {
            let body = self.provide(layer, request, today).await.unwrap_or_default();
            let body = body.trim();
            if !body.is_empty() {
                sections.push(format!("{}\n\n{}", layer.heading(), body));
            }
        }
        truncate_oldest(&sections.join("\n\n"), self.budget_chars)
    }

    async fn provide(
        &self,
        layer: Layer,
        request: &ContextRequest<'_>,
        today: NaiveDate,
    ) -> Option<String> {
        let agent = Scope::agent(request.agent_id);
        match layer {
            Layer::GlobalProcedures => {
                self.procedures(&Scope::Global, request.user_text, today)
                    .await
            }
            Layer::UserPreferences => self.document(&Scope::Global, DocumentKind::Memory).await,
            Layer::Persona => self.document(&agent, DocumentKind::Persona).await,
            Layer::Peers => render_peers(request.agent_id, request.peers),
            Layer::AgentMemory => self.document(&agent, DocumentKind::Memory).await,
            Layer::AgentProcedures => self.procedures(&agent, request.user_text, today).await,
            Layer::CompactionSummary => request.session.summary().map(|t| t.text.clone()),
            Layer::RecentConversation => {
                let lines: Vec<String> = request
                    .session
                    .recent(self.recent_turns)
                    .iter()
                    .map(|t| format!("{}: {}", t.role, t.text.trim()))
                    .collect();
                Some(lines.join("\n"))
            }
        }
    }

    async fn document(&self, scope: &Scope, kind: DocumentKind) -> Option<String> {
        match self.store.get_document(scope, kind).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Skipping {} {} in context: {}", scope, kind.as_str(), e);
                None
            }
        }
    }

    /// Permanent plus usable learned procedures that match the user text.
    async fn procedures(&self, scope: &Scope, query: &str, today: NaiveDate) -> Option<String> {
        let mut all: Vec<Procedure> = self
            .document(scope, DocumentKind::Procedures)
            .await
            .map(|text| procedures::parse_markdown(&text, today))
            .unwrap_or_default();

        match self.extractor.usable(scope, today).await {
            Ok(usable) => procedures::upsert(&mut all, usable, 1.0),
            Err(e) => tracing::warn!("Skipping learned procedures for {}: {}", scope, e),
        }

        let matched = procedures::match_query(&all, query, MATCH_LIMIT);
        if matched.is_empty() {
            return None;
        }
        Some(procedures::render_for_context(&matched))
    }
}

fn render_peers(agent_id: &str, peers: &[Peer]) -> Option<String> {
    let mut others: Vec<&Peer> = peers.iter().filter(|p| p.id != agent_id).collect();
    if others.is_empty() {
        return None;
    }
    others.sort_by(|a, b| a.id.cmp(&b.id));

    let mut lines = vec![format!(
        "Hand a task to another agent with: troupe delegate {} <agent-id> \"<task>\"",
        agent_id
    )];
    lines.extend(others.iter().map(|p| format!("- {}: {}", p.id, p.description)));
    Some(lines.join("\n"))
}

/// Keep the last `budget` characters of `text`.
fn truncate_oldest(text: &str, budget: usize) -> String {
    let total = text.chars().count();
    if total <= budget {
        return text.to_string();
    }
    text.chars().skip(total - budget).collect()
}
