//! Durable document and transcript storage.
//!
//! Documents are addressed by a scope (global or one agent) and a kind. The
//! file-backed store lays them out as:
//!
//! ```text
//! <root>/agents/<id>/agent.json
//! <root>/agents/<id>/SOUL.md
//! <root>/agents/<id>/memory/MEMORY.md
//! <root>/agents/<id>/memory/PROCEDURES.md
//! <root>/agents/<id>/memory/candidates.json
//! <root>/agents/<id>/sessions/<session>.jsonl
//! <root>/agents/<id>/events.jsonl
//! <root>/.memory/USER.md
//! <root>/.memory/PROCEDURES.md
//! <root>/.memory/candidates.json
//! <root>/.memory/knowledge/**
//! <root>/bridge/state.json
//! <root>/delegation/runs.json
//! ```
//!
//! Whole-document writes go through a temporary sibling and a rename so a
//! crash never leaves a half-written file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::MemoryError;
use crate::memory::session::{Turn, sanitize_session_id};

/// Which memory layer a document belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Agent(String),
}

impl Scope {
    pub fn agent(id: impl Into<String>) -> Self {
        Scope::Agent(id.into())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// Document kinds held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Agent descriptor JSON (agent scope only).
    Descriptor,
    /// Persona text (agent scope only).
    Persona,
    /// Free-text memory note. At global scope this is the user preferences note.
    Memory,
    /// Promoted procedures, markdown.
    Procedures,
    /// Procedure candidates with weights, JSON.
    Candidates,
    /// Chat bridge watermark (global scope only).
    BridgeState,
    /// Delegation run registry, JSON (global scope only).
    DelegationRuns,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Persona => "persona",
            DocumentKind::Memory => "memory",
            DocumentKind::Procedures => "procedures",
            DocumentKind::Candidates => "candidates",
            DocumentKind::BridgeState => "bridge state",
            DocumentKind::DelegationRuns => "delegation runs",
        }
    }
}

/// Persistence for memory documents and session transcripts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document. Missing documents are `None`, never an error.
    async fn get_document(
        &self,
        scope: &Scope,
        kind: DocumentKind,
    ) -> Result<Option<String>, MemoryError>;

    /// Replace a document as a whole.
    async fn put_document(
        &self,
        scope: &Scope,
        kind: DocumentKind,
        text: &str,
    ) -> Result<(), MemoryError>;

    /// Append turns to a session, creating it on first write.
    async fn append_turns(
        &self,
        agent_id: &str,
        session_id: &str,
        turns: &[Turn],
    ) -> Result<(), MemoryError>;

    /// Read a session. Unknown sessions read as empty.
    async fn read_session(&self, agent_id: &str, session_id: &str)
    -> Result<Vec<Turn>, MemoryError>;

    /// Replace a session's turns (used by compaction).
    async fn replace_session(
        &self,
        agent_id: &str,
        session_id: &str,
        turns: &[Turn],
    ) -> Result<(), MemoryError>;

    /// Session ids for one agent, sorted.
    async fn list_sessions(&self, agent_id: &str) -> Result<Vec<String>, MemoryError>;

    /// Ids of agents with a stored descriptor, sorted.
    async fn list_agents(&self) -> Result<Vec<String>, MemoryError>;

    /// Remove an agent and everything stored under it.
    async fn delete_agent(&self, agent_id: &str) -> Result<(), MemoryError>;

    /// Relative paths of files under the global knowledge directory, sorted.
    async fn list_knowledge(&self) -> Result<Vec<String>, MemoryError>;

    /// Append one serialised event to an agent's event log.
    async fn append_event(&self, agent_id: &str, line: &str) -> Result<(), MemoryError>;

    /// The last `limit` lines of an agent's event log, oldest first.
    async fn read_events(&self, agent_id: &str, limit: usize) -> Result<Vec<String>, MemoryError>;
}

/// Filesystem-backed store rooted at the data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    fn global_dir(&self) -> PathBuf {
        self.root.join(".memory")
    }

    fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("sessions")
    }

    fn session_path(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.sessions_dir(agent_id)
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }

    fn document_path(&self, scope: &Scope, kind: DocumentKind) -> Result<PathBuf, MemoryError> {
        let path = match (scope, kind) {
            (Scope::Agent(id), DocumentKind::Descriptor) => self.agent_dir(id).join("agent.json"),
            (Scope::Agent(id), DocumentKind::Persona) => self.agent_dir(id).join("SOUL.md"),
            (Scope::Agent(id), DocumentKind::Memory) => {
                self.agent_dir(id).join("memory").join("MEMORY.md")
            }
            (Scope::Agent(id), DocumentKind::Procedures) => {
                self.agent_dir(id).join("memory").join("PROCEDURES.md")
            }
            (Scope::Agent(id), DocumentKind::Candidates) => {
                self.agent_dir(id).join("memory").join("candidates.json")
            }
            (Scope::Global, DocumentKind::Memory) => self.global_dir().join("USER.md"),
            (Scope::Global, DocumentKind::Procedures) => self.global_dir().join("PROCEDURES.md"),
            (Scope::Global, DocumentKind::Candidates) => {
                self.global_dir().join("candidates.json")
            }
            (Scope::Global, DocumentKind::BridgeState) => {
                self.root.join("bridge").join("state.json")
            }
            (Scope::Global, DocumentKind::DelegationRuns) => {
                self.root.join("delegation").join("runs.json")
            }
            _ => {
                return Err(MemoryError::UnsupportedDocument {
                    scope: scope.to_string(),
                    kind: kind.as_str().to_string(),
                });
            }
        };
        Ok(path)
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get_document(
        &self,
        scope: &Scope,
        kind: DocumentKind,
    ) -> Result<Option<String>, MemoryError> {
        let path = self.document_path(scope, kind)?;
        read_optional(&path).await
    }

    async fn put_document(
        &self,
        scope: &Scope,
        kind: DocumentKind,
        text: &str,
    ) -> Result<(), MemoryError> {
        let path = self.document_path(scope, kind)?;
        write_atomic(&path, text.as_bytes()).await
    }

    async fn append_turns(
        &self,
        agent_id: &str,
        session_id: &str,
        turns: &[Turn],
    ) -> Result<(), MemoryError> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for turn in turns {
            buf.push_str(&serde_json::to_string(turn)?);
            buf.push('\n');
        }
        append_to(&self.session_path(agent_id, session_id), buf.as_bytes()).await
    }

    async fn read_session(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Vec<Turn>, MemoryError> {
        let path = self.session_path(agent_id, session_id);
        let Some(content) = read_optional(&path).await? else {
            return Ok(Vec::new());
        };

        let mut turns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Turn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    // A torn trailing line from an interrupted append is skipped.
                    tracing::warn!("Skipping unreadable turn in {}: {}", path.display(), e);
                }
            }
        }
        Ok(turns)
    }

    async fn replace_session(
        &self,
        agent_id: &str,
        session_id: &str,
        turns: &[Turn],
    ) -> Result<(), MemoryError> {
        let path = self.session_path(agent_id, session_id);
        let mut buf = String::new();
        for turn in turns {
            buf.push_str(&serde_json::to_string(turn)?);
            buf.push('\n');
        }
        write_atomic(&path, buf.as_bytes()).await
    }

    async fn list_sessions(&self, agent_id: &str) -> Result<Vec<String>, MemoryError> {
        let names = list_dir(&self.sessions_dir(agent_id)).await?;
        let mut ids: Vec<String> = names
            .into_iter()
            .filter_map(|name| name.strip_suffix(".jsonl").map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_agents(&self) -> Result<Vec<String>, MemoryError> {
        let mut ids = Vec::new();
        for name in list_dir(&self.agents_dir()).await? {
            let descriptor = self.agent_dir(&name).join("agent.json");
            if tokio::fs::try_exists(&descriptor).await? {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), MemoryError> {
        let dir = self.agent_dir(agent_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_knowledge(&self) -> Result<Vec<String>, MemoryError> {
        let base = self.global_dir().join("knowledge");
        let mut files = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn append_event(&self, agent_id: &str, line: &str) -> Result<(), MemoryError> {
        let mut buf = line.trim_end().to_string();
        buf.push('\n');
        append_to(&self.agent_dir(agent_id).join("events.jsonl"), buf.as_bytes()).await
    }

    async fn read_events(&self, agent_id: &str, limit: usize) -> Result<Vec<String>, MemoryError> {
        let path = self.agent_dir(agent_id).join("events.jsonl");
        let Some(content) = read_optional(&path).await? else {
            return Ok(Vec::new());
        };
        let lines: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].to_vec())
    }
}

async fn append_to(path: &Path, data: &[u8]) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, MemoryError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<String>, MemoryError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Write via a temporary sibling, fsync, then rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
