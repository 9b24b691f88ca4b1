//! Delegate for the notification results socket.

use std::sync::Arc;

use almond_protocol::engine::methods;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::sink::{EventSink, SinkError};
use crate::rpc::{RpcChannel, RpcError, RpcObject};

/// Receives `send(payload)` from the engine and writes the payload to the
/// socket as is.
pub struct ResultsDelegate {
    sink: Arc<dyn EventSink>,
}

impl ResultsDelegate {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl RpcObject for ResultsDelegate {
    fn methods(&self) -> &'static [&'static str] {
        methods::RESULTS_DELEGATE
    }

    async fn invoke(
        &self,
        _channel: &Arc<RpcChannel>,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if method != "send" {
            return Err(RpcError::MethodNotFound(method.to_string()));
        }

        let payload = if args.is_empty() {
            Value::Null
        } else {
            args.swap_remove(0)
        };
        let text = match payload {
            Value::String(text) => text,
            other => other.to_string(),
        };

        match self.sink.send_text(text).await {
            Ok(()) => Ok(Value::Null),
            // Socket went away between the engine's decision and delivery.
            Err(SinkError::Closed) => {
                debug!("Dropping result for a closed socket");
                Ok(Value::Null)
            }
            Err(e) => Err(RpcError::Delegate(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::ChannelSink;
    use crate::rpc::ChannelConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_forwards_payload_verbatim() {
        let (engine, front) = RpcChannel::in_memory_pair(ChannelConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let publication = front.publish_scoped(Arc::new(ResultsDelegate::new(Arc::new(sink))));
        let delegate = engine.proxy(publication.reference().clone());

        delegate
            .call("send", vec![json!("{\"result\":1}")])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("{\"result\":1}"));

        delegate
            .call("send", vec![json!({"raw": [1, 2]})])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("{\"raw\":[1,2]}"));
    }

    #[tokio::test]
    async fn test_closed_socket_is_swallowed() {
        let (engine, front) = RpcChannel::in_memory_pair(ChannelConfig::default());
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let reference = front.publish(Arc::new(ResultsDelegate::new(Arc::new(sink))));

        let result = engine.proxy(reference).call("send", vec![json!("x")]).await;
        assert_eq!(result, Ok(Value::Null));
    }
}
