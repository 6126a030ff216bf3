//! Chat bridge: polls the chat surface and routes mentions to agents.
//!
//! Each cycle fetches messages from the watermark on, drops anything already
//! handled, and processes the rest in ascending `(timestamp, id)` order, one
//! message at a time: submit the turn, post a thinking notice, wait for the
//! reply, post it, then advance and persist the watermark. A cycle therefore
//! never has more than one turn queued on any agent, however many messages
//! it fetched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::agent::descriptor::AgentDescriptor;
use crate::agent::supervisor::{AgentState, Supervisor};
use crate::chat::surface::{Backoff, ChatMessage, ChatSurface};
use crate::config::ChatConfig;
use crate::error::{AgentError, ChatError, MemoryError};
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

/// Handled message ids and content hashes remembered for dedup.
const RECENT_LIMIT: usize = 256;

/// How long `stop` waits for an in-progress cycle.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cursor over the chat surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_id: Option<String>,
    #[serde(default)]
    pub recent_ids: VecDeque<String>,
    #[serde(default)]
    pub recent_hashes: VecDeque<String>,
}

impl Watermark {
    /// Whether `message` was already handled. Anything strictly older than
    /// the cursor is; a message sharing the cursor's timestamp is only
    /// recognised by its id or content hash, since ids carry no order.
    pub fn covers(&self, message: &ChatMessage) -> bool {
        if self.last_timestamp.is_some_and(|last| message.timestamp < last) {
            return true;
        }
        self.recent_ids.contains(&message.id)
            || self.recent_hashes.contains(&content_hash(message))
    }

    /// Record `message` as handled. The cursor never moves backwards.
    pub fn advance(&mut self, message: &ChatMessage) {
        let position = (message.timestamp, message.id.as_str());
        let ahead = match self.last_timestamp {
            Some(last) => position > (last, self.last_id.as_deref().unwrap_or_default()),
            None => true,
        };
        if ahead {
            self.last_timestamp = Some(message.timestamp);
            self.last_id = Some(message.id.clone());
        }
        remember(&mut self.recent_ids, message.id.clone());
        remember(&mut self.recent_hashes, content_hash(message));
    }
}

fn remember(ring: &mut VecDeque<String>, value: String) {
    if ring.contains(&value) {
        return;
    }
    ring.push_back(value);
    while ring.len() > RECENT_LIMIT {
        ring.pop_front();
    }
}

/// Hash of sender, text and timestamp; catches re-deliveries under a new id.
pub fn content_hash(message: &ChatMessage) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(message.sender.id.as_bytes());
    hasher.update(&[0]);
    hasher.update(message.text.trim().as_bytes());
    hasher.update(&[0]);
    hasher.update(message.timestamp.to_rfc3339().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Agent addressed by `message`: linked bot mentions first, then `@name`
/// or `@id` in the text of an enabled agent.
pub fn resolve_target<'a>(
    agents: &'a [AgentDescriptor],
    message: &ChatMessage,
) -> Option<&'a AgentDescriptor> {
    for bot in &message.mentioned_bots {
        if let Some(agent) = agents
            .iter()
            .find(|a| a.bot_user_id.as_deref() == Some(bot.as_str()))
        {
            return Some(agent);
        }
        tracing::warn!("Bot {} is not linked to any agent", bot);
    }

    let lowered = message.text.to_lowercase();
    agents.iter().filter(|a| a.enabled).find(|a| {
        lowered.contains(&format!("@{}", a.name.to_lowercase()))
            || lowered.contains(&format!("@{}", a.id))
    })
}

/// Bridge status payload.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub space_id: Option<String>,
    pub credentials_configured: bool,
    pub auth_ready: bool,
    pub watermark: Option<DateTime<Utc>>,
}

impl BridgeStatus {
    /// Status when no surface could be built from the configuration.
    pub fn unconfigured(config: &ChatConfig) -> Self {
        Self {
            running: false,
            space_id: config.space_id.clone(),
            credentials_configured: credentials_configured(config),
            auth_ready: false,
            watermark: None,
        }
    }
}

fn credentials_configured(config: &ChatConfig) -> bool {
    config.base_url.is_some() && config.token.is_some()
}

/// A message routed to a running agent, not yet submitted.
struct RoutedTurn {
    message_id: String,
    agent_id: String,
    conversation: String,
    text: String,
    prefix: String,
    thinking: String,
}

enum Action {
    Skip,
    Post { conversation: String, text: String },
    Turn(RoutedTurn),
}

/// Outcome counts for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub handled: usize,
    pub delivered: usize,
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Routes chat mentions to agents and posts their replies.
pub struct ChatBridge {
    supervisor: Arc<Supervisor>,
    surface: Arc<dyn ChatSurface>,
    store: Arc<dyn DocumentStore>,
    config: ChatConfig,
    backoff: Backoff,
    watermark: Mutex<Watermark>,
    auth_ready: AtomicBool,
    task: Mutex<Option<PollTask>>,
}

impl ChatBridge {
    /// Build a bridge, restoring the persisted watermark.
    pub async fn open(
        supervisor: Arc<Supervisor>,
        surface: Arc<dyn ChatSurface>,
        store: Arc<dyn DocumentStore>,
        config: ChatConfig,
    ) -> Result<Self, MemoryError> {
        let watermark = match store
            .get_document(&Scope::Global, DocumentKind::BridgeState)
            .await?
        {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Resetting unreadable bridge state: {}", e);
                Watermark::default()
            }),
            None => Watermark::default(),
        };

        Ok(Self {
            supervisor,
            surface,
            store,
            backoff: Backoff::from_config(&config),
            config,
            watermark: Mutex::new(watermark),
            auth_ready: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub async fn watermark(&self) -> Watermark {
        self.watermark.lock().await.clone()
    }

    pub async fn status(&self) -> BridgeStatus {
        let running = self
            .task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished());
        BridgeStatus {
            running,
            space_id: self.config.space_id.clone(),
            credentials_configured: credentials_configured(&self.config),
            auth_ready: self.auth_ready.load(Ordering::SeqCst),
            watermark: self.watermark.lock().await.last_timestamp,
        }
    }

    /// Start the polling loop. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChatError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }
        if self.config.space_id.is_none() {
            return Err(ChatError::NotConfigured {
                reason: "no chat space configured".to_string(),
            });
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(self.clone().run(rx));
        *task = Some(PollTask { shutdown, handle });
        Ok(())
    }

    /// Stop the polling loop after the current cycle.
    pub async fn stop(&self) {
        let Some(PollTask {
            shutdown,
            mut handle,
        }) = self.task.lock().await.take()
        else {
            return;
        };
        let _ = shutdown.send(true);
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("Chat bridge cycle still busy after {:?}, aborting", STOP_TIMEOUT);
            handle.abort();
        }
        tracing::info!("Chat bridge stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Chat bridge polling started for {}",
            self.config.space_id.as_deref().unwrap_or("?")
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                tracing::error!("Chat bridge poll failed: {}", e);
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One fetch-process-advance cycle.
    pub async fn poll_once(&self) -> Result<CycleReport, ChatError> {
        let since = self.watermark.lock().await.last_timestamp;
        let fetched = self
            .backoff
            .retry("Chat fetch", || self.surface.fetch_new_messages(since))
            .await;
        let mut messages = match fetched {
            Ok(messages) => {
                self.auth_ready.store(true, Ordering::SeqCst);
                messages
            }
            Err(e) => {
                self.auth_ready.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut report = CycleReport {
            fetched: messages.len(),
            ..Default::default()
        };
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let mut fresh = Vec::new();
        {
            let watermark = self.watermark.lock().await;
            let mut batch_hashes = HashSet::new();
            for message in messages {
                if watermark.covers(&message) || !batch_hashes.insert(content_hash(&message)) {
                    continue;
                }
                fresh.push(message);
            }
        }
        if fresh.is_empty() {
            return Ok(report);
        }

        let agents = self.supervisor.descriptors().await;
        for message in fresh {
            let action = self.plan(&agents, &message).await;
            if self.deliver(action).await {
                report.delivered += 1;
            }
            self.mark_handled(&message).await;
            report.handled += 1;
        }
        Ok(report)
    }

    async fn plan(&self, agents: &[AgentDescriptor], message: &ChatMessage) -> Action {
        let from_agent = message.sender.is_bot
            || agents
                .iter()
                .any(|a| a.bot_user_id.as_deref() == Some(message.sender.id.as_str()));
        if from_agent {
            return Action::Skip;
        }

        let text = message.text.trim();
        if text.is_empty() {
            return Action::Skip;
        }

        let Some(agent) = resolve_target(agents, message) else {
            tracing::debug!("Message {} is not addressed to any agent", message.id);
            return Action::Skip;
        };
        let conversation = message.conversation().to_string();
        let prefix = agent.display_prefix();

        match self.supervisor.get_agent(&agent.id).await {
            Ok(record) if record.state == AgentState::Running => {}
            Ok(_) => {
                return Action::Post {
                    conversation,
                    text: not_running_notice(&prefix),
                };
            }
            Err(e) => {
                tracing::warn!("Agent {} vanished while routing: {}", agent.id, e);
                return Action::Skip;
            }
        }

        Action::Turn(RoutedTurn {
            message_id: message.id.clone(),
            agent_id: agent.id.clone(),
            conversation,
            text: text.to_string(),
            prefix,
            thinking: format!("{} _{} is thinking..._", agent.emoji, agent.name),
        })
    }

    /// Returns whether a reply or notice was posted.
    async fn deliver(&self, action: Action) -> bool {
        let (conversation, text) = match action {
            Action::Skip => return false,
            Action::Post { conversation, text } => (conversation, text),
            Action::Turn(turn) => {
                let text = self.run_turn(&turn).await;
                (turn.conversation, text)
            }
        };

        match self
            .backoff
            .retry("Chat post", || self.surface.post_message(&conversation, &text))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Dropping reply to {}: {}", conversation, e);
                false
            }
        }
    }

    /// Submit the turn and wait for it; the text to post back.
    async fn run_turn(&self, turn: &RoutedTurn) -> String {
        let handle = match self
            .supervisor
            .submit_turn(&turn.agent_id, &turn.conversation, &turn.text)
            .await
        {
            Ok(handle) => handle,
            Err(AgentError::NotRunning { .. }) => return not_running_notice(&turn.prefix),
            Err(e) => return error_notice(&turn.prefix, &e),
        };
        tracing::info!("Routed message {} to {}", turn.message_id, turn.agent_id);

        // Single attempt; losing the notice never holds up the reply.
        if self.config.thinking_notice {
            if let Err(e) = self
                .surface
                .post_message(&turn.conversation, &turn.thinking)
                .await
            {
                tracing::warn!("Thinking notice to {} failed: {}", turn.conversation, e);
            }
        }

        match handle.wait().await {
            Ok(reply) => format!("{}: {}", turn.prefix, reply),
            Err(e) => error_notice(&turn.prefix, &e),
        }
    }

    async fn mark_handled(&self, message: &ChatMessage) {
        let mut watermark = self.watermark.lock().await;
        watermark.advance(message);
        let persisted = match serde_json::to_string_pretty(&*watermark) {
            Ok(json) => {
                self.store
                    .put_document(&Scope::Global, DocumentKind::BridgeState, &json)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            tracing::error!("Failed to persist bridge watermark: {}", e);
        }
    }
}

fn not_running_notice(prefix: &str) -> String {
    format!("{} is not running right now.", prefix)
}

fn error_notice(prefix: &str, error: &AgentError) -> String {
    format!("{}: error ({}): {}", prefix, error.kind(), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::supervisor::NewAgent;
    use crate::chat::surface::ChatSender;
    use crate::config::{AgentsConfig, ExecutorConfig};
    use crate::memory::store::FileStore;
    use crate::testing::{RecordingSurface, ScriptedExecutor, ScriptedProcess};
    use pretty_assertions::assert_eq;

    fn message(id: &str, secs: i64, text: &str, bots: &[&str]) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender: ChatSender {
                id: "users/ana".to_string(),
                display_name: "Ana".to_string(),
                is_bot: false,
            },
            text: text.to_string(),
            timestamp: DateTime::from_timestamp(1_800_000_000 + secs, 0).unwrap(),
            conversation_id: Some("spaces/s/threads/t1".to_string()),
            mentioned_bots: bots.iter().map(|b| b.to_string()).collect(),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<dyn DocumentStore>,
        supervisor: Arc<Supervisor>,
        executor: Arc<ScriptedExecutor>,
        surface: Arc<RecordingSurface>,
    }

    impl Harness {
        async fn new(process: ScriptedProcess) -> Self {
            Self::with_agents(process, AgentsConfig::default()).await
        }

        async fn with_agents(process: ScriptedProcess, agents: AgentsConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(dir.path()));
            let executor = Arc::new(ScriptedExecutor::new(process));
            let supervisor = Arc::new(Supervisor::new(
                store.clone(),
                executor.clone(),
                &agents,
                &ExecutorConfig::default(),
            ));
            Self {
                _dir: dir,
                store,
                supervisor,
                executor,
                surface: Arc::new(RecordingSurface::new()),
            }
        }

        async fn agent(&self, id: &str, bot: &str, running: bool) {
            self.supervisor
                .create_agent(NewAgent {
                    id: Some(id.to_string()),
                    bot_user_id: Some(bot.to_string()),
                    ..NewAgent::named(id.to_uppercase())
                })
                .await
                .unwrap();
            if running {
                self.supervisor.start(id).await.unwrap();
            }
        }

        fn config(&self) -> ChatConfig {
            ChatConfig::default()
                .with_space("spaces/s")
                .with_poll_interval(Duration::from_millis(20))
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5), 3)
        }

        async fn bridge(&self) -> ChatBridge {
            self.bridge_with(self.config()).await
        }

        async fn bridge_with(&self, config: ChatConfig) -> ChatBridge {
            ChatBridge::open(
                self.supervisor.clone(),
                self.surface.clone(),
                self.store.clone(),
                config,
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_cycle_skips_notices_and_delivers() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;
        h.agent("a2", "bots/a2", false).await;
        h.surface.push(message("m3", 3, "run the report", &["bots/a1"]));
        h.surface.push(message("m1", 1, "anyone?", &["bots/unlinked"]));
        h.surface.push(message("m2", 2, "status please", &["bots/a2"]));

        let bridge = h.bridge().await;
        let report = bridge.poll_once().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                fetched: 3,
                handled: 3,
                delivered: 2
            }
        );

        let texts: Vec<String> = h.surface.posts().into_iter().map(|(_, text)| text).collect();
        assert_eq!(
            texts,
            vec![
                "🤖 A2 is not running right now.",
                "🤖 _A1 is thinking..._",
                "🤖 A1: reply: run the report",
            ]
        );
        assert!(
            h.surface
                .posts()
                .iter()
                .all(|(conversation, _)| conversation == "spaces/s/threads/t1")
        );
        assert_eq!(h.executor.process().prompts(), vec!["run the report"]);

        let watermark = bridge.watermark().await;
        assert_eq!(watermark.last_id.as_deref(), Some("m3"));
        assert_eq!(watermark.recent_ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_restart_does_not_repost() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;
        h.surface.push(message("m1", 1, "hello", &["bots/a1"]));

        h.bridge().await.poll_once().await.unwrap();
        assert_eq!(h.surface.posts().len(), 2);

        // Same raw message re-delivered, once as-is and once under a new id.
        let mut again = message("m1", 1, "hello", &["bots/a1"]);
        h.surface.push(again.clone());
        again.id = "m1-copy".to_string();
        h.surface.push(again);

        let restarted = h.bridge().await;
        assert_eq!(restarted.watermark().await.last_id.as_deref(), Some("m1"));
        let report = restarted.poll_once().await.unwrap();
        assert_eq!(report.handled, 0);
        assert_eq!(h.surface.posts().len(), 2);
        assert_eq!(h.executor.process().prompts(), vec!["hello"]);
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut watermark = Watermark::default();
        watermark.advance(&message("m2", 2, "b", &[]));
        watermark.advance(&message("m1", 1, "a", &[]));
        assert_eq!(watermark.last_id.as_deref(), Some("m2"));
        assert!(watermark.covers(&message("m1", 1, "a", &[])));
        assert!(watermark.covers(&message("m2", 2, "b", &[])));
        // Same timestamp as the cursor but never seen: not covered, whatever
        // its id sorts as.
        assert!(!watermark.covers(&message("m0", 2, "other", &[])));
        assert!(!watermark.covers(&message("m3", 2, "later id", &[])));
        assert!(!watermark.covers(&message("m4", 3, "c", &[])));
        assert!(watermark.covers(&message("m9", 0, "older", &[])));
    }

    #[tokio::test]
    async fn test_late_message_at_cursor_timestamp_is_routed() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;
        h.surface.push(message("m2", 2, "first", &["bots/a1"]));
        let bridge = h.bridge().await;
        bridge.poll_once().await.unwrap();

        // Arrives after m2 was handled, with the same timestamp and a lower id.
        h.surface.push(message("m1", 2, "second", &["bots/a1"]));
        let report = bridge.poll_once().await.unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(h.executor.process().prompts(), vec!["first", "second"]);
        assert_eq!(bridge.watermark().await.last_id.as_deref(), Some("m2"));

        // Both are now remembered.
        assert_eq!(bridge.poll_once().await.unwrap().handled, 0);
    }

    #[tokio::test]
    async fn test_burst_beyond_queue_depth_is_delivered_in_order() {
        let h = Harness::with_agents(
            ScriptedProcess::new(),
            AgentsConfig::default().with_queue_depth(2),
        )
        .await;
        h.agent("a1", "bots/a1", true).await;
        for i in 0..3 {
            h.surface
                .push(message(&format!("m{}", i), i, &format!("q{}", i), &["bots/a1"]));
        }

        let report = h
            .bridge_with(h.config().with_thinking_notice(false))
            .await
            .poll_once()
            .await
            .unwrap();
        assert_eq!(report.delivered, 3);

        let texts: Vec<String> = h.surface.posts().into_iter().map(|(_, text)| text).collect();
        assert_eq!(
            texts,
            vec!["🤖 A1: reply: q0", "🤖 A1: reply: q1", "🤖 A1: reply: q2"]
        );
        assert_eq!(h.executor.process().prompts(), vec!["q0", "q1", "q2"]);
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let mut watermark = Watermark::default();
        for i in 0..(RECENT_LIMIT + 10) {
            watermark.advance(&message(&format!("m{:04}", i), i as i64, "x", &[]));
        }
        assert_eq!(watermark.recent_ids.len(), RECENT_LIMIT);
        assert_eq!(watermark.recent_ids.front().map(String::as_str), Some("m0010"));
    }

    #[tokio::test]
    async fn test_agent_messages_are_ignored() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;

        let mut from_linked_bot = message("m1", 1, "@a1 echo", &[]);
        from_linked_bot.sender.id = "bots/a1".to_string();
        let mut from_other_bot = message("m2", 2, "@a1 echo", &[]);
        from_other_bot.sender.is_bot = true;
        h.surface.push(from_linked_bot);
        h.surface.push(from_other_bot);

        let report = h.bridge().await.poll_once().await.unwrap();
        assert_eq!(report.handled, 2);
        assert!(h.surface.posts().is_empty());
        assert!(h.executor.process().prompts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_turn_posts_error_notice() {
        let h = Harness::new(ScriptedProcess::new().failing()).await;
        h.agent("a1", "bots/a1", true).await;
        h.surface.push(message("m1", 1, "do it", &["bots/a1"]));

        h.bridge().await.poll_once().await.unwrap();
        let posts = h.surface.posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].1, "🤖 _A1 is thinking..._");
        assert!(posts[1].1.starts_with("🤖 A1: error (execution_failed): "));
    }

    #[tokio::test]
    async fn test_fetch_retries_then_gives_up() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;
        h.surface.push(message("m1", 1, "hi", &["bots/a1"]));
        let bridge = h.bridge().await;

        h.surface.fail_fetches(2);
        bridge.poll_once().await.unwrap();
        assert!(bridge.status().await.auth_ready);
        assert_eq!(h.surface.fetches(), 3);

        h.surface.fail_fetches(5);
        assert!(bridge.poll_once().await.is_err());
        let status = bridge.status().await;
        assert!(!status.auth_ready);
        assert_eq!(bridge.watermark().await.last_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_text_mention_fallback() {
        let agents = vec![
            AgentDescriptor::new("iris", "Iris"),
            AgentDescriptor::new("kai", "Kai").with_bot_user_id("bots/kai"),
        ];
        let by_name = message("m1", 1, "hey @Iris can you help", &[]);
        assert_eq!(resolve_target(&agents, &by_name).unwrap().id, "iris");

        let by_bot = message("m2", 2, "hey @iris", &["bots/kai"]);
        assert_eq!(resolve_target(&agents, &by_bot).unwrap().id, "kai");

        let nobody = message("m3", 3, "hello all", &["bots/ghost"]);
        assert!(resolve_target(&agents, &nobody).is_none());
    }

    #[tokio::test]
    async fn test_start_polls_until_stopped() {
        let h = Harness::new(ScriptedProcess::new()).await;
        h.agent("a1", "bots/a1", true).await;
        let bridge = Arc::new(h.bridge().await);

        bridge.start().await.unwrap();
        bridge.start().await.unwrap();
        assert!(bridge.status().await.running);

        h.surface.push(message("m1", 1, "ping", &["bots/a1"]));
        h.surface.wait_for_posts(2).await;
        bridge.stop().await;

        let status = bridge.status().await;
        assert!(!status.running);
        assert_eq!(status.space_id.as_deref(), Some("spaces/s"));
        assert_eq!(h.surface.posts()[1].1, "🤖 A1: reply: ping");
    }
}
