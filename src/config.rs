//! Service configuration.
//!
//! Values come from `TROUPE_*` environment variables (a `.env` file is loaded
//! first if present). Every setting has a default so an empty environment
//! produces a working local setup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub executor: ExecutorConfig,
    pub chat: ChatConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            agents: AgentsConfig::from_env()?,
            executor: ExecutorConfig::from_env()?,
            chat: ChatConfig::from_env()?,
        })
    }
}

/// Agent storage, compaction and context settings.
#[derive(Debug, Clone)]
pub struct AgentsConfig {
    /// Root directory for agents, sessions and global memory.
    pub data_dir: PathBuf,
    /// Compact a session once it holds more turns than this.
    pub compact_threshold: usize,
    /// Raw turns left intact after compaction.
    pub compact_keep_window: usize,
    /// Turns per summarisation request.
    pub compact_chunk_size: usize,
    /// Recent turns included in prompt context.
    pub context_messages: usize,
    /// Upper bound on assembled prompt context, in characters.
    pub context_budget_chars: usize,
    /// Bounded depth of each agent's pending turn queue.
    pub queue_depth: usize,
    /// Candidate weight at which a procedure is offered in context.
    pub procedure_usable_weight: f64,
    /// Candidate weight at which a procedure is persisted permanently.
    pub procedure_permanent_weight: f64,
    /// Trigger similarity at which two procedures are the same entry.
    pub procedure_similarity: f64,
    /// Default bound on a delegated task.
    pub delegation_timeout: Duration,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compact_threshold: 40,
            compact_keep_window: 10,
            compact_chunk_size: 10,
            context_messages: 12,
            context_budget_chars: 24_000,
            queue_depth: 16,
            procedure_usable_weight: 3.0,
            procedure_permanent_weight: 10.0,
            procedure_similarity: 0.8,
            delegation_timeout: Duration::from_secs(300),
        }
    }
}

impl AgentsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            data_dir: optional_env("TROUPE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: parse_env("TROUPE_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            compact_keep_window: parse_env(
                "TROUPE_COMPACT_KEEP_WINDOW",
                defaults.compact_keep_window,
            )?,
            compact_chunk_size: parse_env(
                "TROUPE_COMPACT_CHUNK_SIZE",
                defaults.compact_chunk_size,
            )?,
            context_messages: parse_env("TROUPE_CONTEXT_MESSAGES", defaults.context_messages)?,
            context_budget_chars: parse_env(
                "TROUPE_CONTEXT_BUDGET_CHARS",
                defaults.context_budget_chars,
            )?,
            queue_depth: parse_env("TROUPE_QUEUE_DEPTH", defaults.queue_depth)?.max(1),
            procedure_usable_weight: parse_env(
                "TROUPE_PROCEDURE_USABLE_WEIGHT",
                defaults.procedure_usable_weight,
            )?,
            procedure_permanent_weight: parse_env(
                "TROUPE_PROCEDURE_PERMANENT_WEIGHT",
                defaults.procedure_permanent_weight,
            )?,
            procedure_similarity: parse_env(
                "TROUPE_PROCEDURE_SIMILARITY",
                defaults.procedure_similarity,
            )?
            .clamp(0.1, 1.0),
            delegation_timeout: parse_secs(
                "TROUPE_DELEGATION_TIMEOUT_SECS",
                defaults.delegation_timeout,
            )?,
        })
    }

    /// Use a specific data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the compaction threshold and keep window.
    pub fn with_compaction(mut self, threshold: usize, keep_window: usize) -> Self {
        self.compact_threshold = threshold.max(1);
        self.compact_keep_window = keep_window;
        self
    }

    /// Set the per-agent queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set the prompt context budget.
    pub fn with_context_budget(mut self, chars: usize) -> Self {
        self.context_budget_chars = chars;
        self
    }
}

/// External agent-execution tool settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executable invoked per turn.
    pub command: String,
    /// Arguments placed before the prompt flag.
    pub args: Vec<String>,
    /// Working directory for the subprocess.
    pub workspace_dir: PathBuf,
    /// Bound on the readiness handshake.
    pub launch_timeout: Duration,
    /// Bound on a single live turn.
    pub turn_timeout: Duration,
    /// Grace period between graceful and forced termination.
    pub stop_grace: Duration,
    /// Bound on a single summarisation request.
    pub summary_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec!["-y".to_string()],
            workspace_dir: PathBuf::from("."),
            launch_timeout: Duration::from_secs(15),
            turn_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(5),
            summary_timeout: Duration::from_secs(45),
        }
    }
}

impl ExecutorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            command: optional_env("TROUPE_EXECUTOR_COMMAND").unwrap_or(defaults.command),
            args: optional_env("TROUPE_EXECUTOR_ARGS")
                .map(|raw| parse_list(&raw))
                .unwrap_or(defaults.args),
            workspace_dir: optional_env("TROUPE_EXECUTOR_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            launch_timeout: parse_secs("TROUPE_LAUNCH_TIMEOUT_SECS", defaults.launch_timeout)?,
            turn_timeout: parse_secs("TROUPE_TURN_TIMEOUT_SECS", defaults.turn_timeout)?,
            stop_grace: parse_secs("TROUPE_STOP_GRACE_SECS", defaults.stop_grace)?,
            summary_timeout: parse_secs("TROUPE_SUMMARY_TIMEOUT_SECS", defaults.summary_timeout)?,
        })
    }

    /// Set the executable and its leading arguments.
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    /// Set all three lifecycle timeouts.
    pub fn with_timeouts(mut self, launch: Duration, turn: Duration, grace: Duration) -> Self {
        self.launch_timeout = launch;
        self.turn_timeout = turn;
        self.stop_grace = grace;
        self
    }
}

/// Chat surface and bridge polling settings.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Whether `serve` starts the bridge.
    pub enabled: bool,
    /// Base URL of the chat API.
    pub base_url: Option<String>,
    /// Bearer token for the chat API.
    pub token: Option<SecretString>,
    /// Space (channel) the bridge listens to.
    pub space_id: Option<String>,
    /// Delay between poll cycles.
    pub poll_interval: Duration,
    /// First retry delay after a failed fetch.
    pub backoff_initial: Duration,
    /// Ceiling for the retry delay.
    pub backoff_max: Duration,
    /// Fetch attempts per cycle before giving up until the next interval.
    pub max_fetch_attempts: u32,
    /// Post a "thinking" acknowledgement before running a turn.
    pub thinking_notice: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            token: None,
            space_id: None,
            poll_interval: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_fetch_attempts: 5,
            thinking_notice: true,
        }
    }
}

impl ChatConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            enabled: parse_bool("TROUPE_CHAT_ENABLED", defaults.enabled)?,
            base_url: optional_env("TROUPE_CHAT_BASE_URL"),
            token: optional_env("TROUPE_CHAT_TOKEN").map(SecretString::from),
            space_id: optional_env("TROUPE_CHAT_SPACE_ID"),
            poll_interval: parse_millis("TROUPE_CHAT_POLL_INTERVAL_MS", defaults.poll_interval)?,
            backoff_initial: parse_millis(
                "TROUPE_CHAT_BACKOFF_INITIAL_MS",
                defaults.backoff_initial,
            )?,
            backoff_max: parse_millis("TROUPE_CHAT_BACKOFF_MAX_MS", defaults.backoff_max)?,
            max_fetch_attempts: parse_env(
                "TROUPE_CHAT_MAX_FETCH_ATTEMPTS",
                defaults.max_fetch_attempts,
            )?
            .max(1),
            thinking_notice: parse_bool("TROUPE_CHAT_THINKING_NOTICE", defaults.thinking_notice)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// An enabled bridge needs an endpoint, a token and a space.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let required = [
            ("TROUPE_CHAT_BASE_URL", self.base_url.is_some()),
            ("TROUPE_CHAT_TOKEN", self.token.is_some()),
            ("TROUPE_CHAT_SPACE_ID", self.space_id.is_some()),
        ];
        match required.iter().find(|(_, present)| !present) {
            Some((key, _)) => Err(ConfigError::MissingRequired {
                key: key.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, attempts: u32) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self.max_fetch_attempts = attempts.max(1);
        self
    }

    /// Set the space the bridge listens to.
    pub fn with_space(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    /// Turn the "thinking" acknowledgement on or off.
    pub fn with_thinking_notice(mut self, enabled: bool) -> Self {
        self.thinking_notice = enabled;
        self
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".troupe"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key) {
        Some(raw) => parse_bool_value(&raw).ok_or(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_env(key, default.as_secs_f64())?;
    duration_from_f64(key, secs, 1.0)
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_env(key, default.as_millis() as f64)?;
    duration_from_f64(key, millis, 1000.0)
}

fn duration_from_f64(key: &str, value: f64, per_second: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs_f64(value / per_second))
}

/// Split a comma-separated list, dropping empty items.
pub(crate) fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
