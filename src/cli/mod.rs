//! Command-line interface.

mod agent;
mod delegation;
mod memory;

use clap::{Parser, Subcommand};

use crate::agent::delegation::DEFAULT_PARENT_SESSION;
use crate::agent::events::EventStream;
use crate::config::Config;
use crate::service::Troupe;

pub use agent::AgentCommand;
pub use memory::{GlobalCommand, MemoryCommand};

#[derive(Parser, Debug)]
#[command(name = "troupe", version, about = "Run named chat agents with layered memory")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start enabled agents and the chat bridge, run until Ctrl-C
    Serve,

    /// Manage agents
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Show or replace an agent's memory documents
    #[command(subcommand)]
    Memory(MemoryCommand),

    /// Show or replace the global memory documents
    #[command(subcommand)]
    Global(GlobalCommand),

    /// List an agent's sessions, or print one transcript
    Sessions {
        /// Agent id
        id: String,
        /// Session id
        session: Option<String>,
    },

    /// Hand a task from one agent to another and wait for the result
    Delegate {
        /// Delegating agent id
        parent: String,
        /// Agent that runs the task
        child: String,
        /// Task text, or `-` for stdin
        task: String,
        /// Parent session the task belongs to
        #[arg(long, default_value = DEFAULT_PARENT_SESSION)]
        session: String,
        /// Seconds to wait before the run times out
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List delegation runs, newest first, or print one
    Runs {
        /// Run id
        run_id: Option<String>,
        /// Only runs started by this agent
        #[arg(long)]
        parent: Option<String>,
    },

    /// Print an agent's recorded events as JSON lines
    Events {
        /// Agent id
        id: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// lifecycle, turn or delegation
        #[arg(long)]
        stream: Option<EventStream>,
    },

    /// Print chat bridge status
    Status,
}

/// Run a parsed command.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let troupe = Troupe::open(config).await?;
    match cli.command {
        Command::Serve => serve(&troupe).await,
        Command::Agent(cmd) => agent::run_agent_command(&troupe, cmd).await,
        Command::Memory(cmd) => memory::run_memory_command(&troupe, cmd).await,
        Command::Global(cmd) => memory::run_global_command(&troupe, cmd).await,
        Command::Sessions { id, session } => {
            memory::show_sessions(&troupe, &id, session.as_deref()).await
        }
        Command::Delegate {
            parent,
            child,
            task,
            session,
            timeout,
        } => {
            let args = delegation::DelegateArgs {
                parent,
                child,
                task,
                session,
                timeout_secs: timeout,
            };
            delegation::delegate(&troupe, args).await
        }
        Command::Runs { run_id, parent } => {
            delegation::show_runs(&troupe, run_id.as_deref(), parent.as_deref()).await
        }
        Command::Events { id, limit, stream } => {
            delegation::show_events(&troupe, &id, limit, stream).await
        }
        Command::Status => print_json(&troupe.bridge_status().await),
    }
}

async fn serve(troupe: &Troupe) -> anyhow::Result<()> {
    let started = troupe.start().await;
    println!("troupe running with {} agent(s); Ctrl-C to stop", started);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    troupe.shutdown().await;
    Ok(())
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `-` reads the text from stdin.
pub(crate) fn read_text(arg: String) -> anyhow::Result<String> {
    if arg != "-" {
        return Ok(arg);
    }
    let mut text = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_agent_create() {
        let cli = Cli::try_parse_from([
            "troupe", "agent", "create", "Iris", "--emoji", "🦉", "--mcp", "files", "--mcp", "web",
        ])
        .unwrap();
        match cli.command {
            Command::Agent(AgentCommand::Create { name, emoji, mcp, .. }) => {
                assert_eq!(name, "Iris");
                assert_eq!(emoji.as_deref(), Some("🦉"));
                assert_eq!(mcp, vec!["files", "web"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_delegate_defaults() {
        let cli = Cli::try_parse_from(["troupe", "delegate", "iris", "kai", "check logs"]).unwrap();
        match cli.command {
            Command::Delegate {
                parent,
                child,
                session,
                timeout,
                ..
            } => {
                assert_eq!((parent.as_str(), child.as_str()), ("iris", "kai"));
                assert_eq!(session, "default");
                assert_eq!(timeout, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["troupe", "events", "kai", "--stream", "turn"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Events {
                limit: 50,
                stream: Some(EventStream::Turn),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["troupe", "events", "kai", "--stream", "bogus"]).is_err());
    }

    #[test]
    fn test_parse_global_set_procedures() {
        let cli = Cli::try_parse_from(["troupe", "global", "set", "--procedures", "-"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Global(GlobalCommand::Set { procedures: true, .. })
        ));
    }
}
