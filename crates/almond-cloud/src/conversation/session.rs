//! One open conversation and the delegate the engine talks back to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use almond_protocol::{ConversationUser, engine::methods};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;

use crate::backend::ConversationProxy;
use crate::rpc::{Publication, RpcChannel, RpcError, RpcObject};

/// Most recently active conversation id.
#[derive(Debug, Default)]
pub(crate) struct Recency {
    last: Mutex<Option<String>>,
}

impl Recency {
    pub(crate) fn touch(&self, id: &str) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
    }

    pub(crate) fn clear_if(&self, id: &str) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(id) {
            *last = None;
        }
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Stable object the engine holds for a session.
///
/// Forwards the chat methods to whichever delegate is currently bound, so a
/// reconnecting browser can take over a session without the engine noticing.
/// The engine's `active` call marks the session as the most recent one.
pub struct SessionDelegate {
    session_id: String,
    inner: RwLock<Arc<dyn RpcObject>>,
    active: AtomicBool,
    recency: Arc<Recency>,
}

impl SessionDelegate {
    pub(crate) fn new(
        session_id: impl Into<String>,
        inner: Arc<dyn RpcObject>,
        recency: Arc<Recency>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            inner: RwLock::new(inner),
            active: AtomicBool::new(false),
            recency,
        }
    }

    pub fn rebind(&self, delegate: Arc<dyn RpcObject>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn current(&self) -> Arc<dyn RpcObject> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl RpcObject for SessionDelegate {
    fn methods(&self) -> &'static [&'static str] {
        methods::SESSION_DELEGATE
    }

    async fn invoke(
        &self,
        channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if method == methods::ACTIVE {
            self.active.store(true, Ordering::Relaxed);
            self.recency.touch(&self.session_id);
            return Ok(Value::Null);
        }

        let delegate = self.current();
        if !delegate.methods().contains(&method) {
            return Err(RpcError::MethodNotFound(method.to_string()));
        }
        delegate.invoke(channel, method, args).await
    }
}

/// A conversation opened on the engine on behalf of one user.
pub struct ConversationSession {
    id: String,
    user: ConversationUser,
    created_at: DateTime<Utc>,
    conversation: ConversationProxy,
    delegate: Arc<SessionDelegate>,
    publication: Mutex<Option<Publication>>,
}

impl ConversationSession {
    pub(crate) fn new(
        id: impl Into<String>,
        user: ConversationUser,
        conversation: ConversationProxy,
        delegate: Arc<SessionDelegate>,
        publication: Publication,
    ) -> Self {
        Self {
            id: id.into(),
            user,
            created_at: Utc::now(),
            conversation,
            delegate,
            publication: Mutex::new(Some(publication)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &ConversationUser {
        &self.user
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The remote conversation.
    pub fn conversation(&self) -> &ConversationProxy {
        &self.conversation
    }

    /// Whether the engine reported activity on this conversation.
    pub fn is_active(&self) -> bool {
        self.delegate.is_active()
    }

    /// False once the channel the conversation lives on has closed.
    pub fn is_connected(&self) -> bool {
        self.conversation.is_connected()
    }

    /// Route engine output to a different delegate.
    pub fn rebind(&self, delegate: Arc<dyn RpcObject>) {
        debug!("Rebinding delegate of conversation {}", self.id);
        self.delegate.rebind(delegate);
    }

    /// Revoke the delegate and drop the remote conversation object.
    pub(crate) async fn teardown(&self) {
        let publication = self
            .publication
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut publication) = publication {
            publication.release();
        }

        if let Err(e) = self.conversation.release().await {
            debug!("Releasing conversation {}: {e}", self.id);
        }
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.id)
            .field("user", &self.user.id)
            .field("created_at", &self.created_at)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_clear_only_matching() {
        let recency = Recency::default();
        recency.touch("a");
        recency.clear_if("b");
        assert_eq!(recency.get().as_deref(), Some("a"));
        recency.clear_if("a");
        assert_eq!(recency.get(), None);
    }
}
