//! Scripted collaborators for unit tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::agent::descriptor::AgentDescriptor;
use crate::agent::executor::{AgentExecutor, AgentProcess};
use crate::chat::surface::{ChatMessage, ChatSurface};
use crate::error::{AgentError, ChatError};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ==================== Execution ====================

/// In-process stand-in for the execution tool.
///
/// Replies `"reply: {text}"` unless a fixed reply is set. Every delivered
/// user text is recorded before the turn does anything else.
pub struct ScriptedProcess {
    reply: Option<String>,
    fail: bool,
    crash_marker: Option<String>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    alive: AtomicBool,
    prompts: Mutex<Vec<String>>,
    contexts: Mutex<Vec<String>>,
}

impl Default for ScriptedProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self {
            reply: None,
            fail: false,
            crash_marker: None,
            delay: Duration::ZERO,
            gate: None,
            alive: AtomicBool::new(true),
            prompts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Every turn fails with `ExecutionFailed`.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Turns whose text contains `marker` crash the process.
    pub fn crash_on(mut self, marker: impl Into<String>) -> Self {
        self.crash_marker = Some(marker.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each turn waits for one permit before replying.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Simulate the process dying between turns.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// User texts in delivery order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Contexts in delivery order.
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }

    pub async fn wait_for_prompts(&self, count: usize) {
        wait_until("prompts", || self.prompts.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl AgentProcess for ScriptedProcess {
    async fn run_turn(
        &self,
        context: &str,
        text: &str,
        _timeout: Duration,
    ) -> Result<String, AgentError> {
        self.prompts.lock().unwrap().push(text.to_string());
        self.contexts.lock().unwrap().push(context.to_string());

        if !self.is_alive() {
            return Err(AgentError::SubprocessCrash {
                reason: "scripted process is dead".into(),
            });
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(marker) = &self.crash_marker {
            if text.contains(marker.as_str()) {
                self.crash();
                return Err(AgentError::SubprocessCrash {
                    reason: "killed by signal 9".into(),
                });
            }
        }
        if self.fail {
            return Err(AgentError::ExecutionFailed {
                reason: "exit status 1: scripted failure".into(),
            });
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("reply: {}", text)))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&self) {
        self.crash();
    }

    async fn kill(&self) {
        self.crash();
    }
}

/// Executor handing out one shared [`ScriptedProcess`]; launching revives it.
pub struct ScriptedExecutor {
    process: Arc<ScriptedProcess>,
    launches: AtomicUsize,
    fail: AtomicBool,
    launch_delay: Mutex<Duration>,
}

impl ScriptedExecutor {
    pub fn new(process: ScriptedProcess) -> Self {
        Self {
            process: Arc::new(process),
            launches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn process(&self) -> Arc<ScriptedProcess> {
        self.process.clone()
    }

    /// Successful launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn launch(
        &self,
        descriptor: &AgentDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn AgentProcess>, AgentError> {
        let delay = *self.launch_delay.lock().unwrap();
        tokio::time::timeout(timeout, tokio::time::sleep(delay))
            .await
            .map_err(|_| AgentError::timeout("launch handshake", timeout))?;

        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::LaunchFailed {
                reason: format!("scripted launch failure for {}", descriptor.id),
            });
        }
        self.process.revive();
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.process.clone())
    }
}

// ==================== Chat ====================

/// In-memory chat surface that records posts.
#[derive(Default)]
pub struct RecordingSurface {
    inbox: Mutex<Vec<ChatMessage>>,
    posts: Mutex<Vec<(String, String)>>,
    failing_fetches: AtomicU32,
    fetches: AtomicU32,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        self.inbox.lock().unwrap().push(message);
    }

    /// `(conversation, text)` pairs in post order.
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }

    /// Make the next `count` fetches fail.
    pub fn fail_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Fetch calls so far, failed ones included.
    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn wait_for_posts(&self, count: usize) {
        wait_until("posts", || self.posts.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl ChatSurface for RecordingSurface {
    async fn fetch_new_messages(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }

        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| since.is_none_or(|since| m.timestamp >= since))
            .cloned()
            .collect())
    }

    async fn post_message(&self, conversation_id: &str, text: &str) -> Result<(), ChatError> {
        self.posts
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), text.to_string()));
        Ok(())
    }
}
