//! Session compaction.
//!
//! Once a session holds more than `threshold` turns, everything except the
//! newest `keep_window` turns is summarised into a single summary turn. The
//! summary is produced chunk by chunk through the agent's own execution
//! process; a chunk whose summarisation fails falls back to a metadata-only
//! line so compaction always makes progress.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::agent::executor::AgentProcess;
use crate::config::{AgentsConfig, ExecutorConfig};
use crate::error::MemoryError;
use crate::memory::session::{Turn, TurnRole};
use crate::memory::store::DocumentStore;

const CHUNK_INSTRUCTIONS: &str = "Summarize this transcript chunk for long-term memory compaction.\n\
Return 2-3 short bullet points only.\n\
Prioritize decisions, facts, preferences, and completed actions.\n\
Do not include markdown headers or code fences.";

const MAX_LINE_CHARS: usize = 320;
const MAX_BULLETS: usize = 3;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[\.\)]\s*(.+)$").expect("numbered pattern is valid"));

/// Result of a compaction that actually ran.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// Turns folded into the summary, oldest first.
    pub compacted: Vec<Turn>,
    /// The summary turn now heading the session.
    pub summary: Turn,
    /// Session length after compaction.
    pub remaining: usize,
}

/// Summarises and truncates long sessions.
#[derive(Debug, Clone)]
pub struct Compactor {
    threshold: usize,
    keep_window: usize,
    chunk_size: usize,
    summary_timeout: Duration,
}

impl Compactor {
    pub fn new(threshold: usize, keep_window: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            // A compacted session (summary + window) must itself be at or under threshold.
            keep_window: keep_window.min(threshold - 1),
            chunk_size: 10,
            summary_timeout: Duration::from_secs(45),
        }
    }

    pub fn from_config(agents: &AgentsConfig, executor: &ExecutorConfig) -> Self {
        Self::new(agents.compact_threshold, agents.compact_keep_window)
            .with_chunk_size(agents.compact_chunk_size)
            .with_summary_timeout(executor.summary_timeout)
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    /// Number of leading turns to fold, or `None` when at or under threshold.
    pub fn plan(&self, turn_count: usize) -> Option<usize> {
        if turn_count <= self.threshold {
            return None;
        }
        let fold = turn_count - self.keep_window;
        // Folding a single existing summary into itself changes nothing.
        (fold >= 2).then_some(fold)
    }

    /// Compact one session if it is over threshold.
    ///
    /// Callers must hold the agent's memory lock so no turn is appended
    /// between the read and the rewrite.
    pub async fn maybe_compact(
        &self,
        store: &dyn DocumentStore,
        agent_id: &str,
        session_id: &str,
        summarizer: &dyn AgentProcess,
    ) -> Result<Option<Compaction>, MemoryError> {
        let turns = store.read_session(agent_id, session_id).await?;
        let Some(fold) = self.plan(turns.len()) else {
            return Ok(None);
        };

        let (prefix, kept) = turns.split_at(fold);
        let text = self.summarize(prefix, summarizer).await;
        // Take the timestamp of the newest folded turn so ordering is preserved.
        let stamp = prefix
            .last()
            .map(|t| t.timestamp)
            .unwrap_or_else(chrono::Utc::now);
        let summary = Turn::summary(text).at(stamp);

        let mut rewritten = Vec::with_capacity(kept.len() + 1);
        rewritten.push(summary.clone());
        rewritten.extend_from_slice(kept);
        store
            .replace_session(agent_id, session_id, &rewritten)
            .await?;

        tracing::info!(
            "Compacted session {}/{}: {} turns folded, {} remain",
            agent_id,
            session_id,
            prefix.len(),
            rewritten.len()
        );

        Ok(Some(Compaction {
            compacted: prefix.to_vec(),
            summary,
            remaining: rewritten.len(),
        }))
    }

    async fn summarize(&self, turns: &[Turn], summarizer: &dyn AgentProcess) -> String {
        let mut lines = Vec::new();
        for (index, chunk) in turns.chunks(self.chunk_size).enumerate() {
            let prompt = chunk_prompt(chunk);
            let bullets = match summarizer
                .run_turn("", &prompt, self.summary_timeout)
                .await
            {
                Ok(reply) => {
                    let normalized = normalize_summary(&reply);
                    if normalized.is_empty() {
                        fallback_summary(chunk)
                    } else {
                        normalized
                    }
                }
                Err(e) => {
                    tracing::warn!("Chunk summarization failed, using fallback: {}", e);
                    fallback_summary(chunk)
                }
            };
            lines.push(format!("Chunk {}:", index + 1));
            lines.push(bullets);
        }
        lines.join("\n")
    }
}

fn chunk_prompt(turns: &[Turn]) -> String {
    let mut out = format!("{}\n\nTranscript:", CHUNK_INSTRUCTIONS);
    for turn in turns {
        let compact = WHITESPACE.replace_all(turn.text.trim(), " ");
        if compact.is_empty() {
            continue;
        }
        let line = if compact.chars().count() > MAX_LINE_CHARS {
            let cut: String = compact.chars().take(MAX_LINE_CHARS - 3).collect();
            format!("{}...", cut.trim_end())
        } else {
            compact.into_owned()
        };
        out.push_str(&format!("\n{}: {}", turn.role, line));
    }
    out
}

/// Reduce a model reply to at most three `- ` bullets.
fn normalize_summary(reply: &str) -> String {
    let cleaned = reply
        .replace('\r', "")
        .replace("```markdown", "")
        .replace("```text", "")
        .replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    let mut bullets = Vec::new();
    for raw in cleaned.lines() {
        let mut line = raw.trim();
        if let Some(rest) = line.strip_prefix(['-', '*']) {
            line = rest.trim();
        } else if let Some(caps) = NUMBERED.captures(line) {
            if let Some(m) = caps.get(1) {
                line = m.as_str().trim();
            }
        }
        if line.is_empty() {
            continue;
        }
        bullets.push(format!("- {}", line));
        if bullets.len() >= MAX_BULLETS {
            break;
        }
    }

    if bullets.is_empty() {
        let one_line = WHITESPACE.replace_all(cleaned, " ");
        let clipped: String = one_line.chars().take(220).collect();
        bullets.push(format!("- {}", clipped));
    }
    bullets.join("\n")
}

fn fallback_summary(turns: &[Turn]) -> String {
    let human = turns.iter().filter(|t| t.role == TurnRole::Human).count();
    let agent = turns.iter().filter(|t| t.role == TurnRole::Agent).count();
    format!(
        "- Summarized {} turns ({} human, {} agent).",
        turns.len(),
        human,
        agent
    )
}
