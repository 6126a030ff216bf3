//! Structured agent events.
//!
//! Lifecycle transitions, turns and delegations publish [`AgentEvent`]s on a
//! shared [`EventBus`]. Events belong to a run (one launch of an agent, one
//! turn, one delegation) and carry a sequence number that starts at 1 within
//! that run. The bus keeps a bounded buffer of recent events, fans every
//! event out to broadcast subscribers and, when backed by a store, appends
//! it to the agent's event log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::error::MemoryError;
use crate::memory::store::DocumentStore;

/// Events kept in memory for `recent`.
pub const RECENT_EVENTS: usize = 500;

/// Broadcast buffer; slow subscribers skip ahead instead of blocking emitters.
const CHANNEL_CAPACITY: usize = 256;

/// Which part of the system an event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Lifecycle,
    Turn,
    Delegation,
}

impl EventStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStream::Lifecycle => "lifecycle",
            EventStream::Turn => "turn",
            EventStream::Delegation => "delegation",
        }
    }
}

impl std::str::FromStr for EventStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lifecycle" => Ok(EventStream::Lifecycle),
            "turn" => Ok(EventStream::Turn),
            "delegation" => Ok(EventStream::Delegation),
            other => Err(format!("unknown event stream '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_id: String,
    pub run_id: String,
    pub agent_id: String,
    pub seq: u64,
    pub stream: EventStream,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub session_id: Option<String>,
}

/// Fan-out point for agent events.
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
    recent: Mutex<VecDeque<AgentEvent>>,
    max_recent: usize,
    store: Option<Arc<dyn DocumentStore>>,
}

impl EventBus {
    pub fn new(max_recent: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recent: Mutex::new(VecDeque::new()),
            max_recent: max_recent.max(1),
            store: None,
        }
    }

    /// Also append every event to the agent's event log in `store`.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start a new run for `agent_id`.
    pub fn run(self: &Arc<Self>, agent_id: &str, session_id: Option<&str>) -> RunEvents {
        self.run_as(&uuid::Uuid::new_v4().to_string(), agent_id, session_id)
    }

    /// Start a run under a caller-chosen id.
    pub fn run_as(self: &Arc<Self>, run_id: &str, agent_id: &str, session_id: Option<&str>) -> RunEvents {
        RunEvents {
            bus: self.clone(),
            agent_id: agent_id.to_string(),
            run_id: run_id.to_string(),
            session_id: session_id.map(str::to_string),
            seq: AtomicU64::new(0),
        }
    }

    /// Receive every event published from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    async fn publish(&self, event: AgentEvent) {
        {
            let mut recent = self.recent.lock().await;
            recent.push_back(event.clone());
            while recent.len() > self.max_recent {
                recent.pop_front();
            }
        }

        // No subscribers is fine.
        let _ = self.tx.send(event.clone());

        if let Some(store) = &self.store {
            let persisted = match serde_json::to_string(&event) {
                Ok(line) => store.append_event(&event.agent_id, &line).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = persisted {
                tracing::warn!("Failed to record event for {}: {}", event.agent_id, e);
            }
        }
    }

    /// The newest buffered events matching the filters, oldest first.
    pub async fn recent(
        &self,
        agent_id: Option<&str>,
        stream: Option<EventStream>,
        limit: usize,
    ) -> Vec<AgentEvent> {
        let recent = self.recent.lock().await;
        let matched: Vec<&AgentEvent> = recent
            .iter()
            .filter(|e| agent_id.is_none_or(|id| e.agent_id == id))
            .filter(|e| stream.is_none_or(|s| e.stream == s))
            .collect();
        let start = matched.len().saturating_sub(limit.max(1));
        matched[start..].iter().map(|e| (*e).clone()).collect()
    }

    /// The agent's event log, falling back to the in-memory buffer when the
    /// bus has no store. Unreadable lines are skipped.
    pub async fn history(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentEvent>, MemoryError> {
        let Some(store) = &self.store else {
            return Ok(self.recent(Some(agent_id), None, limit).await);
        };
        let lines = store.read_events(agent_id, limit.max(1)).await?;
        Ok(lines
            .iter()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Skipping unreadable event for {}: {}", agent_id, e);
                    None
                }
            })
            .collect())
    }
}

/// Emitter bound to one run; numbers its events 1, 2, 3, ...
pub struct RunEvents {
    bus: Arc<EventBus>,
    agent_id: String,
    run_id: String,
    session_id: Option<String>,
    seq: AtomicU64,
}

impl RunEvents {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn emit(
        &self,
        stream: EventStream,
        event_type: &str,
        data: serde_json::Value,
    ) -> AgentEvent {
        let event = AgentEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            agent_id: self.agent_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            stream,
            event_type: event_type.to_string(),
            ts: Utc::now(),
            data,
            session_id: self.session_id.clone(),
        };
        self.bus.publish(event.clone()).await;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::FileStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_seq_counts_per_run() {
        let bus = Arc::new(EventBus::new(RECENT_EVENTS));
        let first_run = bus.run("alpha", Some("s1"));
        let other_run = bus.run("alpha", None);

        let first = first_run.emit(EventStream::Turn, "turn.assigned", json!({})).await;
        let second = first_run.emit(EventStream::Turn, "turn.completed", json!({})).await;
        let other = other_run.emit(EventStream::Turn, "turn.assigned", json!({})).await;

        assert_eq!((first.seq, second.seq, other.seq), (1, 2, 1));
        assert_eq!(first.run_id, second.run_id);
        assert_ne!(first.run_id, other.run_id);
        assert_eq!(first.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_until_dropped() {
        let bus = Arc::new(EventBus::new(RECENT_EVENTS));
        let mut rx = bus.subscribe();
        let run = bus.run("alpha", None);

        let emitted = run
            .emit(EventStream::Lifecycle, "agent.started", json!({"model": "gemini"}))
            .await;
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.event_id, emitted.event_id);

        drop(rx);
        // Publishing without subscribers still succeeds.
        run.emit(EventStream::Lifecycle, "agent.stopped", json!({})).await;
        assert_eq!(bus.recent(None, None, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_recent_is_bounded_and_filtered() {
        let bus = Arc::new(EventBus::new(3));
        let alpha = bus.run("alpha", None);
        for idx in 0..5 {
            alpha
                .emit(EventStream::Turn, "turn.completed", json!({ "idx": idx }))
                .await;
        }
        let idx: Vec<i64> = bus
            .recent(None, None, 10)
            .await
            .iter()
            .map(|e| e.data["idx"].as_i64().unwrap())
            .collect();
        assert_eq!(idx, vec![2, 3, 4]);

        bus.run("beta", None)
            .emit(EventStream::Lifecycle, "agent.started", json!({}))
            .await;
        let beta = bus.recent(Some("beta"), None, 10).await;
        assert_eq!(beta.len(), 1);
        assert_eq!(beta[0].agent_id, "beta");
        assert_eq!(bus.recent(None, Some(EventStream::Turn), 10).await.len(), 2);
        assert_eq!(bus.recent(None, None, 1).await[0].agent_id, "beta");
    }

    #[tokio::test]
    async fn test_history_reads_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(RECENT_EVENTS).with_store(store));

        let emitted = bus
            .run("alpha", None)
            .emit(EventStream::Lifecycle, "agent.started", json!({"model": "gemini"}))
            .await;

        let restarted = EventBus::new(RECENT_EVENTS)
            .with_store(Arc::new(FileStore::new(dir.path())));
        let history = restarted.history("alpha", 10).await.unwrap();
        assert_eq!(history, vec![emitted]);
        assert!(restarted.recent(None, None, 10).await.is_empty());
    }

    #[test]
    fn test_stream_names() {
        assert_eq!("turn".parse::<EventStream>(), Ok(EventStream::Turn));
        assert!("gemini".parse::<EventStream>().is_err());
        assert_eq!(
            serde_json::to_string(&EventStream::Delegation).unwrap(),
            "\"delegation\""
        );
    }
}
