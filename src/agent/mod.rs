//! Agents and their runtime.
//!
//! - Descriptors: identity, persona and execution settings
//! - Execution processes behind the [`AgentExecutor`] seam
//! - The lifecycle supervisor that owns per-agent queues
//! - Structured events and agent-to-agent delegation

pub mod delegation;
pub mod descriptor;
pub mod events;
pub mod executor;
pub mod supervisor;

pub use delegation::{DelegationRequest, DelegationRun, Delegator, RunStatus};
pub use descriptor::{AgentDescriptor, AgentPatch, PatchEffect};
pub use events::{AgentEvent, EventBus, EventStream};
pub use executor::{AgentExecutor, AgentProcess, CliExecutor};
pub use supervisor::{AgentRecord, AgentState, NewAgent, Supervisor, TurnHandle};
