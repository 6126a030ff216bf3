//! Agent descriptors: identity, persona and execution settings.
//!
//! A descriptor is stored as `agent.json` (everything except the persona)
//! plus `SOUL.md` (the persona text). Ids are lowercase slugs.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, MemoryError};
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

pub const DEFAULT_EMOJI: &str = "🤖";
pub const DEFAULT_MODEL: &str = "gemini";
pub const WILDCARD_SERVER: &str = "*";
const SUMMARY_CHARS: usize = 140;

static AGENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("id pattern is valid"));

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));

/// A named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    /// Persona text; persisted separately as `SOUL.md`.
    #[serde(skip)]
    pub soul: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Capability servers the agent may use. `["*"]` allows all.
    #[serde(default = "default_servers")]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_emoji() -> String {
    DEFAULT_EMOJI.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_servers() -> Vec<String> {
    vec![WILDCARD_SERVER.to_string()]
}

fn default_enabled() -> bool {
    true
}

impl AgentDescriptor {
    /// A descriptor with defaults for everything but id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            emoji: default_emoji(),
            soul: String::new(),
            model: default_model(),
            mcp_servers: default_servers(),
            bot_user_id: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_emoji(mut self, emoji: impl Into<String>) -> Self {
        self.emoji = emoji.into();
        self
    }

    pub fn with_soul(mut self, soul: impl Into<String>) -> Self {
        self.soul = soul.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_servers(mut self, servers: Vec<String>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn with_bot_user_id(mut self, bot_user_id: impl Into<String>) -> Self {
        self.bot_user_id = Some(bot_user_id.into());
        self
    }

    /// Trim fields and fill blanks with defaults.
    pub fn normalized(mut self) -> Self {
        self.id = self.id.trim().to_string();
        self.name = match self.name.trim() {
            "" => self.id.clone(),
            name => name.to_string(),
        };
        self.emoji = match self.emoji.trim() {
            "" => default_emoji(),
            emoji => emoji.to_string(),
        };
        self.soul = self.soul.trim().to_string();
        self.model = match self.model.trim() {
            "" => default_model(),
            model => model.to_string(),
        };
        let servers: Vec<String> = self
            .mcp_servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.mcp_servers = if servers.is_empty() {
            default_servers()
        } else {
            servers
        };
        self.bot_user_id = self
            .bot_user_id
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        self
    }

    /// Whether every capability server is allowed.
    pub fn allows_all_servers(&self) -> bool {
        self.mcp_servers.iter().any(|s| s == WILDCARD_SERVER)
    }

    /// Prefix used when posting on the agent's behalf.
    pub fn display_prefix(&self) -> String {
        format!("{} {}", self.emoji, self.name)
    }

    /// One-line description for other agents: the first non-blank persona
    /// line without heading marks, capped at 140 characters.
    pub fn summary(&self) -> String {
        let line = self
            .soul
            .lines()
            .map(|l| l.trim().trim_start_matches('#').trim())
            .find(|l| !l.is_empty());
        match line {
            Some(line) => line.chars().take(SUMMARY_CHARS).collect(),
            None => "No description provided.".to_string(),
        }
    }
}

/// Partial update applied by `update_agent`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub emoji: Option<String>,
    pub soul: Option<String>,
    pub model: Option<String>,
    pub mcp_servers: Option<Vec<String>>,
    /// `Some(None)` clears the link.
    #[serde(default, deserialize_with = "double_option")]
    pub bot_user_id: Option<Option<String>>,
    pub enabled: Option<bool>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// What an applied patch changed, for lifecycle follow-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchEffect {
    pub enabled_changed: bool,
    /// Model or server allowlist changed; a running agent must restart.
    pub execution_changed: bool,
}

impl AgentPatch {
    /// Apply to `descriptor`, returning what changed. Result is normalised.
    pub fn apply(self, descriptor: &mut AgentDescriptor) -> PatchEffect {
        let before = descriptor.clone();
        let mut next = descriptor.clone();

        if let Some(name) = self.name {
            next.name = name;
        }
        if let Some(emoji) = self.emoji {
            next.emoji = emoji;
        }
        if let Some(soul) = self.soul {
            next.soul = soul;
        }
        if let Some(model) = self.model {
            next.model = model;
        }
        if let Some(servers) = self.mcp_servers {
            next.mcp_servers = servers;
        }
        if let Some(bot) = self.bot_user_id {
            next.bot_user_id = bot;
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }

        *descriptor = next.normalized();
        PatchEffect {
            enabled_changed: before.enabled != descriptor.enabled,
            execution_changed: before.model != descriptor.model
                || before.mcp_servers != descriptor.mcp_servers,
        }
    }
}

/// Whether `id` is a valid agent slug.
pub fn is_valid_agent_id(id: &str) -> bool {
    AGENT_ID.is_match(id.trim())
}

pub fn validate_agent_id(id: &str) -> Result<(), AgentError> {
    if is_valid_agent_id(id) {
        Ok(())
    } else {
        Err(AgentError::InvalidId { id: id.to_string() })
    }
}

/// Derive a slug from a display name.
pub fn slugify(value: &str) -> String {
    let lowered = value.to_lowercase();
    let slug = NON_SLUG.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "agent".to_string()
    } else {
        slug.to_string()
    }
}

/// First of `base`, `base-2`, `base-3`, ... not in `taken`.
pub fn unique_agent_id(preferred: &str, taken: &HashSet<String>) -> Result<String, AgentError> {
    let base = if is_valid_agent_id(preferred) {
        preferred.trim().to_string()
    } else {
        slugify(preferred)
    };
    if !taken.contains(&base) {
        return Ok(base);
    }
    (2..1000)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .ok_or(AgentError::AlreadyExists { id: base })
}

/// Load a descriptor and its persona. `None` if no descriptor is stored.
pub async fn load(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<AgentDescriptor>, MemoryError> {
    let scope = Scope::agent(id);
    let Some(raw) = store.get_document(&scope, DocumentKind::Descriptor).await? else {
        return Ok(None);
    };
    let mut descriptor: AgentDescriptor = serde_json::from_str(&raw)?;
    descriptor.id = id.to_string();
    descriptor.soul = store
        .get_document(&scope, DocumentKind::Persona)
        .await?
        .unwrap_or_default();
    Ok(Some(descriptor.normalized()))
}

/// Persist a descriptor. `created_at` of an existing record is preserved.
pub async fn save(
    store: &dyn DocumentStore,
    descriptor: AgentDescriptor,
) -> Result<AgentDescriptor, MemoryError> {
    let mut saved = descriptor.normalized();
    if let Some(existing) = load(store, &saved.id).await? {
        saved.created_at = existing.created_at;
    }
    saved.updated_at = Utc::now();

    let scope = Scope::agent(&saved.id);
    let mut json = serde_json::to_string_pretty(&saved)?;
    json.push('\n');
    store
        .put_document(&scope, DocumentKind::Descriptor, &json)
        .await?;

    let soul = if saved.soul.is_empty() {
        String::new()
    } else {
        format!("{}\n", saved.soul)
    };
    store
        .put_document(&scope, DocumentKind::Persona, &soul)
        .await?;
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::FileStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_agent_id_validation() {
        assert!(is_valid_agent_id("a1"));
        assert!(is_valid_agent_id("research-bot-2"));
        assert!(!is_valid_agent_id("Research"));
        assert!(!is_valid_agent_id("a--b"));
        assert!(!is_valid_agent_id("-a"));
        assert!(matches!(
            validate_agent_id("../etc"),
            Err(AgentError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Research Bot!"), "research-bot");
        assert_eq!(slugify("  __  "), "agent");
        assert_eq!(slugify("Ünïcode  name"), "n-code-name");
    }

    #[test]
    fn test_unique_agent_id() {
        let mut taken = HashSet::new();
        assert_eq!(unique_agent_id("Iris", &taken).unwrap(), "iris");
        taken.insert("iris".to_string());
        taken.insert("iris-2".to_string());
        assert_eq!(unique_agent_id("Iris", &taken).unwrap(), "iris-3");
    }

    #[test]
    fn test_normalization_defaults() {
        let descriptor = AgentDescriptor::new("a1", "  ")
            .with_emoji(" ")
            .with_model("")
            .with_servers(vec![" ".to_string()])
            .with_bot_user_id("  ")
            .normalized();
        assert_eq!(descriptor.name, "a1");
        assert_eq!(descriptor.emoji, DEFAULT_EMOJI);
        assert_eq!(descriptor.model, DEFAULT_MODEL);
        assert_eq!(descriptor.mcp_servers, vec!["*"]);
        assert!(descriptor.allows_all_servers());
        assert_eq!(descriptor.bot_user_id, None);
    }

    #[test]
    fn test_summary_uses_first_persona_line() {
        let descriptor = AgentDescriptor::new("a1", "Iris").with_soul("\n## Researcher\nDigs deep.");
        assert_eq!(descriptor.summary(), "Researcher");
        assert_eq!(
            AgentDescriptor::new("a2", "Blank").summary(),
            "No description provided."
        );
        let long = AgentDescriptor::new("a3", "Long").with_soul("x".repeat(300));
        assert_eq!(long.summary().chars().count(), 140);
    }

    #[test]
    fn test_patch_effects() {
        let mut descriptor = AgentDescriptor::new("a1", "Iris");

        let effect = AgentPatch {
            soul: Some("new persona".into()),
            ..Default::default()
        }
        .apply(&mut descriptor);
        assert_eq!(effect, PatchEffect::default());
        assert_eq!(descriptor.soul, "new persona");

        let effect = AgentPatch {
            model: Some("gemini-pro".into()),
            enabled: Some(false),
            ..Default::default()
        }
        .apply(&mut descriptor);
        assert!(effect.enabled_changed);
        assert!(effect.execution_changed);

        let effect = AgentPatch {
            mcp_servers: Some(vec![]),
            ..Default::default()
        }
        .apply(&mut descriptor);
        // Empty list normalises back to the wildcard, which is unchanged.
        assert!(!effect.execution_changed);
    }

    #[test]
    fn test_patch_deserializes_null_bot_as_clear() {
        let patch: AgentPatch = serde_json::from_str(r#"{"bot_user_id": null}"#).unwrap();
        assert_eq!(patch.bot_user_id, Some(None));
        let patch: AgentPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(patch.bot_user_id, None);
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let first = save(
            &store,
            AgentDescriptor::new("a1", "Iris").with_soul("Be helpful."),
        )
        .await
        .unwrap();
        assert!(dir.path().join("agents/a1/agent.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("agents/a1/SOUL.md")).unwrap(),
            "Be helpful.\n"
        );

        let mut changed = first.clone();
        changed.name = "Iris II".into();
        changed.created_at = Utc::now() + chrono::Duration::days(1);
        let second = save(&store, changed).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let loaded = load(&store, "a1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Iris II");
        assert_eq!(loaded.soul, "Be helpful.");
        assert!(load(&store, "missing").await.unwrap().is_none());
    }
}
