//! Conversation sessions opened on the engine.

pub mod manager;
pub mod session;

pub use manager::{ConversationManager, NotifyOutcome};
pub use session::{ConversationSession, SessionDelegate};
