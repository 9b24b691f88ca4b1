//! Connection to the engine process that hosts the assistants.

pub mod client;
pub mod config;
pub mod proxy;

pub use client::{BackendClient, ConnectionStatus};
pub use config::BackendConfig;
pub use proxy::{AssistantProvider, AssistantProxy, ControlProxy, ConversationProxy, EngineControl};
