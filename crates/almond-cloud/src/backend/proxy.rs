//! Typed proxies for the engine's remote objects.
//!
//! The remote surface is fixed ahead of time, so every forwarded operation is
//! a plain method here rather than a dynamic lookup. Each proxy wraps a
//! [`RemoteHandle`] and only adds argument encoding and result decoding.

use std::sync::Arc;

use almond_protocol::{
    AppInfo, ConversationOptions, ConversationUser, DeviceInfo, OAuth2Start, ObjectRef,
    engine::methods,
};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::rpc::{RemoteHandle, RpcChannel, RpcError};

/// Operations on the engine's root control object.
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn get_all_apps(&self) -> Result<Vec<AppInfo>, RpcError>;

    /// `None` when no app has that id.
    async fn get_app(&self, app_id: &str) -> Result<Option<AppInfo>, RpcError>;

    /// Whether an app was removed.
    async fn delete_app(&self, app_id: &str) -> Result<bool, RpcError>;

    async fn get_all_devices(&self) -> Result<Vec<DeviceInfo>, RpcError>;

    /// Configure a device from its serialized state.
    async fn add_device(&self, state: Value) -> Result<(), RpcError>;

    /// Whether a device was removed.
    async fn delete_device(&self, unique_id: &str) -> Result<bool, RpcError>;

    async fn start_oauth2(&self, kind: &str) -> Result<OAuth2Start, RpcError>;

    async fn handle_oauth2_callback(
        &self,
        kind: &str,
        redirect_uri: &str,
        session: Value,
    ) -> Result<(), RpcError>;
}

/// Proxy for the root object announced in the handshake.
#[derive(Debug, Clone)]
pub struct ControlProxy {
    handle: RemoteHandle,
}

impl ControlProxy {
    pub fn new(handle: RemoteHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }

    /// Resolve the assistant object through the root's getter.
    pub async fn assistant(&self) -> Result<AssistantProxy, RpcError> {
        let handle = self
            .handle
            .call_proxy(methods::ASSISTANT_GETTER, vec![])
            .await?;
        Ok(AssistantProxy::new(handle))
    }
}

#[async_trait]
impl EngineControl for ControlProxy {
    async fn get_all_apps(&self) -> Result<Vec<AppInfo>, RpcError> {
        self.handle.call_as("getAllApps", vec![]).await
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<AppInfo>, RpcError> {
        self.handle.call_as("getApp", vec![json!(app_id)]).await
    }

    async fn delete_app(&self, app_id: &str) -> Result<bool, RpcError> {
        self.handle.call_as("deleteApp", vec![json!(app_id)]).await
    }

    async fn get_all_devices(&self) -> Result<Vec<DeviceInfo>, RpcError> {
        self.handle.call_as("getAllDevices", vec![]).await
    }

    async fn add_device(&self, state: Value) -> Result<(), RpcError> {
        self.handle.call("addDevice", vec![state]).await.map(drop)
    }

    async fn delete_device(&self, unique_id: &str) -> Result<bool, RpcError> {
        self.handle
            .call_as("deleteDevice", vec![json!(unique_id)])
            .await
    }

    async fn start_oauth2(&self, kind: &str) -> Result<OAuth2Start, RpcError> {
        self.handle.call_as("startOAuth2", vec![json!(kind)]).await
    }

    async fn handle_oauth2_callback(
        &self,
        kind: &str,
        redirect_uri: &str,
        session: Value,
    ) -> Result<(), RpcError> {
        self.handle
            .call(
                "handleOAuth2Callback",
                vec![json!(kind), json!(redirect_uri), session],
            )
            .await
            .map(drop)
    }
}

/// Proxy for the engine's assistant object.
#[derive(Debug, Clone)]
pub struct AssistantProxy {
    handle: RemoteHandle,
}

impl AssistantProxy {
    pub fn new(handle: RemoteHandle) -> Self {
        Self { handle }
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        self.handle.channel()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Open a conversation whose output goes to `delegate`.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        user: &ConversationUser,
        delegate: &ObjectRef,
        options: &ConversationOptions,
    ) -> Result<ConversationProxy, RpcError> {
        let handle = self
            .handle
            .call_proxy(
                "openConversation",
                vec![
                    json!(conversation_id),
                    json!(user),
                    delegate.to_value(),
                    json!(options),
                ],
            )
            .await?;
        Ok(ConversationProxy::new(handle))
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<(), RpcError> {
        self.handle
            .call("closeConversation", vec![json!(conversation_id)])
            .await
            .map(drop)
    }

    /// Subscribe a results delegate to the user's notifications.
    pub async fn add_output(&self, delegate: &ObjectRef) -> Result<(), RpcError> {
        self.handle
            .call("addOutput", vec![delegate.to_value()])
            .await
            .map(drop)
    }

    pub async fn remove_output(&self, delegate: &ObjectRef) -> Result<(), RpcError> {
        self.handle
            .call("removeOutput", vec![delegate.to_value()])
            .await
            .map(drop)
    }

    /// Create an app from a program and return its description.
    pub async fn create_app(&self, params: Value) -> Result<Value, RpcError> {
        self.handle.call("createApp", vec![params]).await
    }

    /// Parse an utterance without running it.
    pub async fn parse(&self, sentence: &str, target: Option<&str>) -> Result<Value, RpcError> {
        self.handle
            .call("parse", vec![json!(sentence), json!(target)])
            .await
    }
}

/// Proxy for one remote conversation.
#[derive(Debug, Clone)]
pub struct ConversationProxy {
    handle: RemoteHandle,
}

impl ConversationProxy {
    pub fn new(handle: RemoteHandle) -> Self {
        Self { handle }
    }

    pub fn reference(&self) -> &ObjectRef {
        self.handle.reference()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Begin the conversation, e.g. emit the welcome message.
    pub async fn start(&self) -> Result<(), RpcError> {
        self.handle.call("start", vec![]).await.map(drop)
    }

    pub async fn handle_command(&self, text: &str) -> Result<(), RpcError> {
        self.handle
            .call("handleCommand", vec![json!(text)])
            .await
            .map(drop)
    }

    pub async fn handle_parsed_command(&self, json: Value) -> Result<(), RpcError> {
        self.handle
            .call("handleParsedCommand", vec![json])
            .await
            .map(drop)
    }

    pub async fn handle_thingtalk(&self, code: &str) -> Result<(), RpcError> {
        self.handle
            .call("handleThingTalk", vec![json!(code)])
            .await
            .map(drop)
    }

    pub async fn notify(&self, args: Vec<Value>) -> Result<(), RpcError> {
        self.handle.call("notify", args).await.map(drop)
    }

    pub async fn notify_error(&self, args: Vec<Value>) -> Result<(), RpcError> {
        self.handle.call("notifyError", args).await.map(drop)
    }

    /// Drop the engine-side object.
    pub async fn release(&self) -> Result<(), RpcError> {
        self.handle.release().await
    }
}

/// Source of the assistant proxy for callers that outlive one connection.
#[async_trait]
pub trait AssistantProvider: Send + Sync {
    async fn assistant(&self) -> Result<AssistantProxy, RpcError>;
}

#[async_trait]
impl AssistantProvider for AssistantProxy {
    async fn assistant(&self) -> Result<AssistantProxy, RpcError> {
        if self.is_connected() {
            Ok(self.clone())
        } else {
            Err(RpcError::BackendUnavailable)
        }
    }
}
