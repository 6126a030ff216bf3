//! Session transcripts.
//!
//! A session is the ordered list of turns for one (agent, conversation) pair.
//! Turns are only ever appended, except by compaction which replaces a prefix
//! with a single summary turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Human,
    Agent,
    /// Compaction summary of earlier turns.
    Summary,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::Human => "human",
            TurnRole::Agent => "agent",
            TurnRole::Summary => "summary",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a turn stamped with the current time.
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Human, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Agent, text)
    }

    pub fn summary(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Summary, text)
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_summary(&self) -> bool {
        self.role == TurnRole::Summary
    }
}

/// A loaded session transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn new(id: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            id: id.into(),
            turns,
        }
    }

    /// The compaction summary heading the session, if any.
    pub fn summary(&self) -> Option<&Turn> {
        self.turns.first().filter(|t| t.is_summary())
    }

    /// The last `n` raw turns, oldest first. The summary is never counted.
    pub fn recent(&self, n: usize) -> &[Turn] {
        let raw = match self.summary() {
            Some(_) => &self.turns[1..],
            None => &self.turns[..],
        };
        &raw[raw.len().saturating_sub(n)..]
    }
}

/// Stamp `turn` so it sorts strictly after `previous`.
///
/// Wall clocks can step backwards or repeat at coarse resolution; transcripts
/// must stay strictly time-ordered regardless.
pub fn ordered_after(previous: Option<&Turn>, mut turn: Turn) -> Turn {
    if let Some(prev) = previous {
        if turn.timestamp <= prev.timestamp {
            turn.timestamp = prev.timestamp + chrono::Duration::microseconds(1);
        }
    }
    turn
}

/// Keep session ids to a filesystem-safe alphabet.
pub fn sanitize_session_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "default".to_string(),
        _ => cleaned,
    }
}
