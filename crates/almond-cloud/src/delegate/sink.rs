//! Outbound side of one browser socket.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Size of the per-connection send buffer.
pub const SINK_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The socket is gone.
    #[error("socket closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Something that can push text frames to one open socket.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn send_text(&self, text: String) -> Result<(), SinkError>;
}

/// Sink feeding the writer task of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    /// A sink plus the receiver its writer task drains.
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SINK_BUFFER_SIZE);
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send_text(&self, text: String) -> Result<(), SinkError> {
        self.tx.send(text).await.map_err(|_| SinkError::Closed)
    }
}
