//! Agent management commands.

use clap::Subcommand;

use crate::agent::supervisor::NewAgent;
use crate::cli::print_json;
use crate::service::Troupe;

#[derive(Subcommand, Debug, Clone)]
pub enum AgentCommand {
    /// List all agents
    List,

    /// Show one agent
    Show {
        /// Agent id
        id: String,
    },

    /// Create an agent (stopped)
    Create {
        /// Display name; the id is derived from it
        name: String,

        /// Emoji used when posting
        #[arg(long)]
        emoji: Option<String>,

        /// Model selector passed to the execution tool
        #[arg(long)]
        model: Option<String>,

        /// Persona text
        #[arg(long)]
        soul: Option<String>,

        /// Allowed capability server (repeatable; default all)
        #[arg(long)]
        mcp: Vec<String>,

        /// Create disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Delete an agent and everything stored for it
    Delete {
        /// Agent id
        id: String,
    },

    /// Link an agent to its chat bot user id (empty unlinks)
    Link {
        /// Agent id
        id: String,
        /// Bot user id on the chat surface
        bot_user_id: String,
    },

    /// Start the agent in-process, send one message and print the reply
    Ask {
        /// Agent id
        id: String,
        /// Message text
        text: String,
    },
}

/// Run an agent command.
pub async fn run_agent_command(troupe: &Troupe, cmd: AgentCommand) -> anyhow::Result<()> {
    match cmd {
        AgentCommand::List => {
            let agents = troupe.list_agents().await;
            if agents.is_empty() {
                println!("No agents. Create one with: troupe agent create <name>");
                return Ok(());
            }
            let width = agents.iter().map(|a| a.id.len()).max().unwrap_or(0);
            for agent in agents {
                println!(
                    "  {:width$}  {} {:20}  {:8}  {}",
                    agent.id,
                    agent.emoji,
                    agent.name,
                    agent.state.as_str(),
                    if agent.enabled { "enabled" } else { "disabled" },
                    width = width
                );
            }
            Ok(())
        }
        AgentCommand::Show { id } => print_json(&troupe.get_agent(&id).await?),
        AgentCommand::Create {
            name,
            emoji,
            model,
            soul,
            mcp,
            disabled,
        } => {
            let record = troupe
                .create_agent(NewAgent {
                    emoji: emoji.unwrap_or_default(),
                    model: model.unwrap_or_default(),
                    soul: soul.unwrap_or_default(),
                    mcp_servers: mcp,
                    enabled: Some(!disabled),
                    ..NewAgent::named(name)
                })
                .await?;
            println!("Created agent {}", record.id);
            Ok(())
        }
        AgentCommand::Delete { id } => {
            troupe.delete_agent(&id).await?;
            println!("Deleted agent {}", id);
            Ok(())
        }
        AgentCommand::Link { id, bot_user_id } => {
            let record = troupe.link_agent_bot(&id, &bot_user_id).await?;
            match record.bot_user_id {
                Some(bot) => println!("Linked {} to {}", id, bot),
                None => println!("Unlinked {}", id),
            }
            Ok(())
        }
        AgentCommand::Ask { id, text } => {
            troupe.start_agent(&id).await?;
            let reply = troupe.submit_test_message(&id, &text).await;
            troupe.stop_agent(&id).await?;
            println!("{}", reply?);
            Ok(())
        }
    }
}
