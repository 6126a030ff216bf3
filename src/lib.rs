//! troupe: a supervisor for named conversational agents.
//!
//! Each agent has a persona, layered memory and an execution process that
//! generates its replies. A chat bridge routes mentions from an external
//! chat surface to the addressed agent and posts the replies back.

pub mod agent;
pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod memory;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{AgentError, ChatError, ConfigError, MemoryError};
pub use service::Troupe;
