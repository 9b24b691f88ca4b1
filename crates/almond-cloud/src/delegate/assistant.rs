//! Delegate for a conversation socket.
//!
//! The engine drives the chat UI by calling these methods; each becomes one
//! tagged [`ServerMessage`] on the browser socket.

use std::sync::Arc;

use almond_protocol::{ServerMessage, engine::methods};
use async_trait::async_trait;
use serde_json::Value;

use super::sink::{EventSink, SinkError};
use crate::rpc::{RpcChannel, RpcError, RpcObject, arg};

pub struct AssistantDelegate {
    sink: Arc<dyn EventSink>,
}

impl AssistantDelegate {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn send_text(&self, text: String, icon: Option<String>) -> Result<(), SinkError> {
        self.push(&ServerMessage::Text { text, icon }).await
    }

    pub async fn send_picture(&self, url: String, icon: Option<String>) -> Result<(), SinkError> {
        self.push(&ServerMessage::Picture { url, icon }).await
    }

    pub async fn send_rdl(&self, rdl: Value, icon: Option<String>) -> Result<(), SinkError> {
        self.push(&ServerMessage::Rdl { rdl, icon }).await
    }

    pub async fn send_choice(
        &self,
        idx: i64,
        title: String,
        text: Option<String>,
    ) -> Result<(), SinkError> {
        self.push(&ServerMessage::Choice { idx, title, text }).await
    }

    pub async fn send_button(&self, title: String, json: Value) -> Result<(), SinkError> {
        self.push(&ServerMessage::Button { title, json }).await
    }

    pub async fn send_link(&self, title: String, url: String) -> Result<(), SinkError> {
        self.push(&ServerMessage::Link { title, url }).await
    }

    pub async fn send_ask_special(&self, ask: Option<String>) -> Result<(), SinkError> {
        self.push(&ServerMessage::AskSpecial { ask }).await
    }

    /// Report a failed browser command.
    pub async fn send_error(&self, error: String) -> Result<(), SinkError> {
        self.push(&ServerMessage::Error { error }).await
    }

    async fn push(&self, message: &ServerMessage) -> Result<(), SinkError> {
        let text = serde_json::to_string(message).map_err(|e| SinkError::Send(e.to_string()))?;
        self.sink.send_text(text).await
    }
}

#[async_trait]
impl RpcObject for AssistantDelegate {
    fn methods(&self) -> &'static [&'static str] {
        methods::ASSISTANT_DELEGATE
    }

    async fn invoke(
        &self,
        _channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let a = &args;
        let sent = match method {
            "send" => self.send_text(arg(method, a, 0)?, arg(method, a, 1)?).await,
            "sendPicture" => self.send_picture(arg(method, a, 0)?, arg(method, a, 1)?).await,
            "sendRDL" => self.send_rdl(arg(method, a, 0)?, arg(method, a, 1)?).await,
            // Argument 1 is the engine's choice kind, which the UI does not use.
            "sendChoice" => {
                self.send_choice(arg(method, a, 0)?, arg(method, a, 2)?, arg(method, a, 3)?)
                    .await
            }
            "sendButton" => self.send_button(arg(method, a, 0)?, arg(method, a, 1)?).await,
            "sendLink" => self.send_link(arg(method, a, 0)?, arg(method, a, 1)?).await,
            "sendAskSpecial" => self.send_ask_special(arg(method, a, 0)?).await,
            _ => return Err(RpcError::MethodNotFound(method.to_string())),
        };

        sent.map(|()| Value::Null)
            .map_err(|e| RpcError::Delegate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::ChannelSink;
    use crate::rpc::ChannelConfig;
    use serde_json::json;

    async fn next_json(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Value {
        let text = rx.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_engine_calls_become_tagged_messages() {
        let (engine, front) = RpcChannel::in_memory_pair(ChannelConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let publication = front.publish_scoped(Arc::new(AssistantDelegate::new(Arc::new(sink))));
        let delegate = engine.proxy(publication.reference().clone());

        delegate.call("send", vec![json!("hello")]).await.unwrap();
        assert_eq!(next_json(&mut rx).await, json!({"type": "text", "text": "hello"}));

        delegate
            .call(
                "sendChoice",
                vec![json!(2), json!("choice"), json!("Yes"), json!("yes please")],
            )
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut rx).await,
            json!({"type": "choice", "idx": 2, "title": "Yes", "text": "yes please"})
        );

        delegate
            .call("sendLink", vec![json!("Docs"), json!("https://example.com")])
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut rx).await,
            json!({"type": "link", "title": "Docs", "url": "https://example.com"})
        );

        delegate.call("sendAskSpecial", vec![]).await.unwrap();
        assert_eq!(
            next_json(&mut rx).await,
            json!({"type": "askSpecial", "ask": null})
        );
    }

    #[tokio::test]
    async fn test_bad_arguments_and_closed_socket() {
        let (engine, front) = RpcChannel::in_memory_pair(ChannelConfig::default());
        let (sink, rx) = ChannelSink::new();
        let reference = front.publish(Arc::new(AssistantDelegate::new(Arc::new(sink))));
        let delegate = engine.proxy(reference);

        let err = delegate.call("send", vec![json!(5)]).await.unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGS");

        drop(rx);
        let err = delegate.call("send", vec![json!("late")]).await.unwrap_err();
        assert_eq!(err.code(), "E_DELEGATE");
    }
}
