//! Memory document and transcript commands.

use clap::Subcommand;

use crate::cli::{print_json, read_text};
use crate::service::Troupe;

#[derive(Subcommand, Debug, Clone)]
pub enum MemoryCommand {
    /// Print an agent's memory (or procedures) document
    Show {
        /// Agent id
        id: String,
        /// Use PROCEDURES.md instead of MEMORY.md
        #[arg(long)]
        procedures: bool,
    },

    /// Replace an agent's memory (or procedures) document
    Set {
        /// Agent id
        id: String,
        /// New text, or `-` for stdin
        text: String,
        /// Use PROCEDURES.md instead of MEMORY.md
        #[arg(long)]
        procedures: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum GlobalCommand {
    /// Print the global user memory (or procedures)
    Show {
        #[arg(long)]
        procedures: bool,
    },

    /// Replace the global user memory (or procedures)
    Set {
        /// New text, or `-` for stdin
        text: String,
        #[arg(long)]
        procedures: bool,
    },

    /// List files in the global knowledge directory
    Knowledge,
}

pub async fn run_memory_command(troupe: &Troupe, cmd: MemoryCommand) -> anyhow::Result<()> {
    match cmd {
        MemoryCommand::Show { id, procedures } => {
            let text = if procedures {
                troupe.get_agent_procedures(&id).await?
            } else {
                troupe.get_agent_memory(&id).await?
            };
            print!("{}", text);
        }
        MemoryCommand::Set {
            id,
            text,
            procedures,
        } => {
            let text = read_text(text)?;
            if procedures {
                troupe.update_agent_procedures(&id, &text).await?;
            } else {
                troupe.update_agent_memory(&id, &text).await?;
            }
            println!("Saved");
        }
    }
    Ok(())
}

pub async fn run_global_command(troupe: &Troupe, cmd: GlobalCommand) -> anyhow::Result<()> {
    match cmd {
        GlobalCommand::Show { procedures } => {
            let text = if procedures {
                troupe.get_global_procedures().await?
            } else {
                troupe.get_global_user_memory().await?
            };
            print!("{}", text);
        }
        GlobalCommand::Set { text, procedures } => {
            let text = read_text(text)?;
            if procedures {
                troupe.update_global_procedures(&text).await?;
            } else {
                troupe.update_global_user_memory(&text).await?;
            }
            println!("Saved");
        }
        GlobalCommand::Knowledge => {
            for file in troupe.list_global_knowledge().await? {
                println!("{}", file);
            }
        }
    }
    Ok(())
}

/// Without a session id, list sessions; otherwise dump the transcript.
pub async fn show_sessions(troupe: &Troupe, id: &str, session: Option<&str>) -> anyhow::Result<()> {
    match session {
        None => {
            for session in troupe.list_sessions(id).await? {
                println!("{}", session);
            }
            Ok(())
        }
        Some(session) => print_json(&troupe.get_session(id, session).await?),
    }
}
