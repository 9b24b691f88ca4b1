//! Local objects the engine calls to reach browser sockets.

pub mod assistant;
pub mod results;
pub mod sink;

pub use assistant::AssistantDelegate;
pub use results::ResultsDelegate;
pub use sink::{ChannelSink, EventSink, SinkError};
