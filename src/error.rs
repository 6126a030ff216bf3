//! Error types for the agent supervisor, memory layer and chat bridge.

use std::time::Duration;

/// Errors surfaced by agent lifecycle and turn operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Unknown agent.
    #[error("Agent not found: {id}")]
    NotFound { id: String },

    /// Agent id is not a valid slug.
    #[error("Invalid agent id '{id}': use lowercase letters, numbers and dashes")]
    InvalidId { id: String },

    /// An agent with this id already exists.
    #[error("Agent already exists: {id}")]
    AlreadyExists { id: String },

    /// A lifecycle call collided with a stop in progress.
    #[error("Agent {id} is already transitioning ({state})")]
    AlreadyTransitioning { id: String, state: String },

    /// The agent is not accepting turns.
    #[error("Agent {id} is not running ({state})")]
    NotRunning { id: String, state: String },

    /// The per-agent queue is full.
    #[error("Agent {id} queue is full ({depth} pending)")]
    Backpressure { id: String, depth: usize },

    /// Launch handshake, graceful stop or turn exceeded its bound.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The execution subprocess died unexpectedly.
    #[error("Agent subprocess crashed: {reason}")]
    SubprocessCrash { reason: String },

    /// The execution subprocess could not be launched.
    #[error("Agent launch failed: {reason}")]
    LaunchFailed { reason: String },

    /// The execution tool ran but reported a failure for this turn.
    #[error("Turn execution failed: {reason}")]
    ExecutionFailed { reason: String },

    /// The chat surface or execution tool could not be reached.
    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    /// A queued turn was dropped by a stop.
    #[error("Turn cancelled before it started")]
    Cancelled,

    /// A delegation request was rejected before it ran.
    #[error("Invalid delegation: {reason}")]
    InvalidDelegation { reason: String },

    /// Unknown delegation run.
    #[error("Delegation run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Memory store failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl AgentError {
    /// Stable short name used in notices and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::NotFound { .. } => "not_found",
            AgentError::InvalidId { .. } => "invalid_id",
            AgentError::AlreadyExists { .. } => "already_exists",
            AgentError::AlreadyTransitioning { .. } => "already_transitioning",
            AgentError::NotRunning { .. } => "not_running",
            AgentError::Backpressure { .. } => "backpressure",
            AgentError::Timeout { .. } => "timeout",
            AgentError::SubprocessCrash { .. } => "subprocess_crash",
            AgentError::LaunchFailed { .. } => "launch_failed",
            AgentError::ExecutionFailed { .. } => "execution_failed",
            AgentError::UpstreamUnavailable { .. } => "upstream_unavailable",
            AgentError::Cancelled => "cancelled",
            AgentError::InvalidDelegation { .. } => "invalid_delegation",
            AgentError::RunNotFound { .. } => "run_not_found",
            AgentError::Memory(_) => "memory",
        }
    }

    /// Whether this error means the subprocess can no longer serve turns.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::SubprocessCrash { .. })
    }

    pub(crate) fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        AgentError::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

/// Errors from the document and transcript store.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Procedures document did not parse into any procedure.
    #[error("Invalid procedures format: provide markdown sections with Trigger and Steps")]
    InvalidProcedures,

    /// No transcript exists for this session.
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// Document kind has no location in this scope.
    #[error("No {kind} document in the {scope} scope")]
    UnsupportedDocument { scope: String, kind: String },
}

/// Errors from the external chat surface.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the chat API.
    #[error("Chat API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape.
    #[error("Invalid chat response: {reason}")]
    InvalidResponse { reason: String },

    /// Bridge is missing a base URL, token or space.
    #[error("Chat bridge not configured: {reason}")]
    NotConfigured { reason: String },
}

impl From<ChatError> for AgentError {
    fn from(e: ChatError) -> Self {
        AgentError::UpstreamUnavailable {
            reason: e.to_string(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing required setting: {key}")]
    MissingRequired { key: String },

    /// A setting could not be parsed.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}
