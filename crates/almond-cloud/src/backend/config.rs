//! Backend connection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rpc::{ChannelConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_PENDING_CALLS};

/// Where the engine listens and how hard to try reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// TCP address of the engine's control socket.
    pub address: String,
    /// Pause between losing the channel and the next connection attempt.
    pub reconnect_delay_ms: u64,
    /// Give up on a connection that never sends its ready message.
    pub handshake_timeout_ms: Option<u64>,
    /// Per-call deadline. Unset waits until the call completes or the
    /// channel closes.
    pub call_timeout_ms: Option<u64>,
    pub max_frame_bytes: usize,
    pub max_pending_calls: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8001".to_string(),
            reconnect_delay_ms: 10_000,
            handshake_timeout_ms: Some(30_000),
            call_timeout_ms: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

impl BackendConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Settings for each channel this client opens.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_frame_bytes: self.max_frame_bytes,
            call_timeout: self.call_timeout(),
            max_pending_calls: self.max_pending_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.address, "127.0.0.1:8001");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.channel_config().max_pending_calls, 8192);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BackendConfig = toml::from_str(
            r#"
            address = "10.0.0.5:9000"
            call_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.address, "10.0.0.5:9000");
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.reconnect_delay_ms, 10_000);
    }
}
