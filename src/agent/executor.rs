//! Agent execution processes.
//!
//! Replies are generated by an external command-line tool. An
//! [`AgentExecutor`] launches a per-agent [`AgentProcess`] after a readiness
//! handshake; the process then runs one headless invocation per turn:
//!
//! ```text
//! <command> <args...> [--model M] -p <prompt> [--allowed-mcp-server-names a b]
//! ```
//!
//! Exit status decides the failure class: a non-zero exit fails only the
//! turn, while a spawn failure or death by signal means the agent can no
//! longer serve turns.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::agent::descriptor::{AgentDescriptor, DEFAULT_MODEL};
use crate::config::ExecutorConfig;
use crate::error::AgentError;

const PROMPT_FLAG: &str = "-p";
const MODEL_FLAG: &str = "--model";
const ALLOWED_SERVERS_FLAG: &str = "--allowed-mcp-server-names";
const REASONING_MARKER: char = '✦';
const STDERR_SNIPPET: usize = 200;

/// Launches execution processes for agents.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Launch and handshake within `timeout`.
    async fn launch(
        &self,
        descriptor: &AgentDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn AgentProcess>, AgentError>;
}

/// A launched agent able to run turns one at a time.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Run one turn and return the cleaned reply.
    async fn run_turn(
        &self,
        context: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, AgentError>;

    /// Whether the process can still serve turns.
    fn is_alive(&self) -> bool;

    /// Ask in-flight work to finish and refuse new turns.
    async fn terminate(&self);

    /// Force-stop any in-flight work.
    async fn kill(&self);
}

/// Executor for the configured command-line tool.
#[derive(Debug, Clone)]
pub struct CliExecutor {
    config: ExecutorConfig,
}

impl CliExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .current_dir(&self.config.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl AgentExecutor for CliExecutor {
    async fn launch(
        &self,
        descriptor: &AgentDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn AgentProcess>, AgentError> {
        let mut handshake = self.base_command();
        handshake.arg("--version");

        let output = tokio::time::timeout(timeout, handshake.output())
            .await
            .map_err(|_| AgentError::timeout("launch handshake", timeout))?
            .map_err(|e| AgentError::LaunchFailed {
                reason: format!("failed to run {}: {}", self.config.command, e),
            })?;

        if !output.status.success() {
            return Err(AgentError::LaunchFailed {
                reason: format!(
                    "{} --version exited with {}: {}",
                    self.config.command,
                    output.status,
                    snippet(&String::from_utf8_lossy(&output.stderr))
                ),
            });
        }

        tracing::debug!(
            "Agent {} handshake ok: {}",
            descriptor.id,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        Ok(Arc::new(CliProcess {
            agent_id: descriptor.id.clone(),
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            workspace_dir: self.config.workspace_dir.clone(),
            model: descriptor.model.clone(),
            servers: if descriptor.allows_all_servers() {
                Vec::new()
            } else {
                descriptor.mcp_servers.clone()
            },
            active_pid: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Per-turn headless invocations for one agent.
pub struct CliProcess {
    agent_id: String,
    command: String,
    args: Vec<String>,
    workspace_dir: PathBuf,
    model: String,
    /// Empty means every server is allowed.
    servers: Vec<String>,
    active_pid: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl CliProcess {
    fn turn_command(&self, prompt: &str) -> Command {
        let mut command = Command::new(&self.command);
        command.args(&self.args);
        if self.model != DEFAULT_MODEL {
            command.arg(MODEL_FLAG).arg(&self.model);
        }
        command.arg(PROMPT_FLAG).arg(prompt);
        if !self.servers.is_empty() {
            command.arg(ALLOWED_SERVERS_FLAG).args(&self.servers);
        }
        command
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn set_active(&self, pid: Option<u32>) {
        if let Ok(mut active) = self.active_pid.lock() {
            *active = pid;
        }
    }

    fn active(&self) -> Option<u32> {
        self.active_pid.lock().ok().and_then(|active| *active)
    }
}

#[async_trait]
impl AgentProcess for CliProcess {
    async fn run_turn(
        &self,
        context: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Cancelled);
        }

        let prompt = compose_prompt(context, text);
        let mut child = self
            .turn_command(&prompt)
            .spawn()
            .map_err(|e| AgentError::SubprocessCrash {
                reason: format!("failed to spawn {}: {}", self.command, e),
            })?;
        self.set_active(child.id());

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let result = tokio::time::timeout(timeout, async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_stream(stdout.as_mut()),
                read_stream(stderr.as_mut())
            );
            Ok::<_, std::io::Error>((status?, out, err))
        })
        .await;

        self.set_active(None);

        match result {
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!("Agent {} turn timed out after {:?}", self.agent_id, timeout);
                Err(AgentError::timeout("turn", timeout))
            }
            Ok(Err(e)) => Err(AgentError::SubprocessCrash {
                reason: format!("lost subprocess: {}", e),
            }),
            Ok(Ok((status, out, err))) => {
                if status.success() {
                    return Ok(clean_output(&out));
                }
                match status.code() {
                    Some(code) => Err(AgentError::ExecutionFailed {
                        reason: format!("exited with code {}: {}", code, snippet(&err)),
                    }),
                    None => Err(AgentError::SubprocessCrash {
                        reason: format!("terminated by signal ({})", status),
                    }),
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pid) = self.active() {
            send_terminate(pid);
        }
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pid) = self.active() {
            send_kill(pid);
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("SIGTERM to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!("SIGKILL to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(stream: Option<&mut R>) -> String {
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn snippet(text: &str) -> String {
    text.trim().chars().take(STDERR_SNIPPET).collect()
}

/// Prompt sent to the tool: assembled context followed by the new message.
pub fn compose_prompt(context: &str, text: &str) -> String {
    let context = context.trim();
    if context.is_empty() {
        text.trim().to_string()
    } else {
        format!("{}\n\n# New User Prompt\n{}", context, text.trim())
    }
}

// ==================== Output cleaning ====================

static ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]").expect("csi pattern is valid"));

static ANSI_OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][0-9;]*\x07").expect("osc pattern is valid"));

static ANSI_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\([AB012]").expect("charset pattern is valid"));

static BOX_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[╭╮╯╰─│┌┐└┘├┤┬┴┼═║╒╓╔╕╖╗╘╙╚╛╜╝╞╟╠╡╢╣╤╥╦╧╨╩╪╫╬█■]")
        .expect("box pattern is valid")
});

static SPINNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]").expect("spinner pattern is valid"));

static SCREEN_READER_NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)You are currently in screen reader-friendly view.*?next run\.")
        .expect("notice pattern is valid")
});

static UI_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Prioritizing.*Response",
        r"Clarifying.*Response",
        r".*context file.*YOLO mode",
        r"^\*\s+Type your message",
        r"~\s+no sandbox",
        r"gemini-.* /model",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("noise pattern is valid"))
    .collect()
});

/// Strip terminal decoration and reasoning preamble from tool output.
pub fn clean_output(raw: &str) -> String {
    let text = ANSI_CSI.replace_all(raw, "");
    let text = ANSI_OSC.replace_all(&text, "");
    let text = ANSI_CHARSET.replace_all(&text, "");
    let text = BOX_CHARS.replace_all(&text, "");
    let text = SPINNER.replace_all(&text, "");
    let text = SCREEN_READER_NOTICE.replace_all(&text, "");

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != ">")
        .filter(|l| !UI_NOISE.iter().any(|re| re.is_match(l)))
        .collect();
    let joined = lines.join("\n");

    match joined.split_once(REASONING_MARKER) {
        Some((_, reply)) => reply.trim().to_string(),
        None => joined.trim().to_string(),
    }
}
