//! Bridge between the external chat surface and the agents.

pub mod bridge;
pub mod surface;

pub use bridge::{BridgeStatus, ChatBridge, CycleReport, Watermark};
pub use surface::{ChatMessage, ChatSender, ChatSurface, HttpChatSurface};
