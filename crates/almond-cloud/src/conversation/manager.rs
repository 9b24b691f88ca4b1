//! Registry of open conversations keyed by conversation id.

use std::sync::Arc;

use almond_protocol::{ConversationOptions, ConversationUser};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info};
use serde_json::Value;
use tokio::sync::Mutex;

use super::session::{ConversationSession, Recency, SessionDelegate};
use crate::backend::AssistantProvider;
use crate::rpc::{RpcError, RpcObject};

/// Result of delivering a notification to one conversation.
#[derive(Debug)]
pub struct NotifyOutcome {
    pub session_id: String,
    pub result: Result<(), RpcError>,
}

/// Tracks the conversations this front end opened on the engine.
///
/// Operations on one id are serialized, so a create-if-absent never races a
/// concurrent reopen or close of the same id. Different ids proceed in
/// parallel.
pub struct ConversationManager {
    assistant: Arc<dyn AssistantProvider>,
    sessions: DashMap<String, Arc<ConversationSession>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    recency: Arc<Recency>,
}

impl ConversationManager {
    pub fn new(assistant: Arc<dyn AssistantProvider>) -> Self {
        Self {
            assistant,
            sessions: DashMap::new(),
            locks: DashMap::new(),
            recency: Arc::new(Recency::default()),
        }
    }

    /// Return the live session for `id` bound to `delegate`, opening and
    /// starting one if there is none.
    pub async fn get_or_open(
        &self,
        id: &str,
        user: ConversationUser,
        delegate: Arc<dyn RpcObject>,
        options: ConversationOptions,
    ) -> Result<Arc<ConversationSession>, RpcError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.get_or_open_locked(id, user, delegate, options).await
        };
        self.release_lock(id, lock);
        result
    }

    /// Open a new conversation for `id`, replacing any existing one.
    ///
    /// The conversation is not started; callers wire up their input first
    /// and then call `start` on it.
    pub async fn open(
        &self,
        id: &str,
        user: ConversationUser,
        delegate: Arc<dyn RpcObject>,
        options: ConversationOptions,
    ) -> Result<Arc<ConversationSession>, RpcError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.open_locked(id, user, delegate, options).await
        };
        self.release_lock(id, lock);
        result
    }

    /// Close the conversation for `id`. Unknown ids are ignored.
    pub async fn close(&self, id: &str) {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;
            self.close_locked(id).await;
        }
        self.release_lock(id, lock);
    }

    /// Look up a session, falling back to the most recently active one.
    pub fn get(&self, id: Option<&str>) -> Option<Arc<ConversationSession>> {
        if let Some(session) = id.and_then(|id| self.sessions.get(id)) {
            return Some(Arc::clone(session.value()));
        }
        let recent = self.recency.get()?;
        self.sessions
            .get(&recent)
            .map(|session| Arc::clone(session.value()))
    }

    pub fn most_recent_id(&self) -> Option<String> {
        self.recency.get()
    }

    /// Deliver a notification to every open conversation.
    ///
    /// All deliveries run concurrently and are all awaited; one failing
    /// recipient does not affect the others.
    pub async fn notify_all(&self, args: Vec<Value>) -> Vec<NotifyOutcome> {
        let sessions = self.snapshot();
        join_all(sessions.into_iter().map(|session| {
            let args = args.clone();
            async move {
                let result = session.conversation().notify(args).await;
                NotifyOutcome {
                    session_id: session.id().to_string(),
                    result,
                }
            }
        }))
        .await
    }

    /// Deliver an error notification to every open conversation.
    pub async fn notify_error_all(&self, args: Vec<Value>) -> Vec<NotifyOutcome> {
        let sessions = self.snapshot();
        join_all(sessions.into_iter().map(|session| {
            let args = args.clone();
            async move {
                let result = session.conversation().notify_error(args).await;
                NotifyOutcome {
                    session_id: session.id().to_string(),
                    result,
                }
            }
        }))
        .await
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Close every conversation, e.g. on shutdown.
    pub async fn close_all(&self) {
        for id in self.ids() {
            self.close(&id).await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<ConversationSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    /// Drop the per-id lock once nobody else holds or waits on it.
    fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        // One reference in the map, one held here.
        self.locks
            .remove_if(id, |_, entry| Arc::strong_count(entry) <= 2);
        drop(lock);
    }

    async fn get_or_open_locked(
        &self,
        id: &str,
        user: ConversationUser,
        delegate: Arc<dyn RpcObject>,
        options: ConversationOptions,
    ) -> Result<Arc<ConversationSession>, RpcError> {
        let existing = self.sessions.get(id).map(|entry| Arc::clone(entry.value()));
        if let Some(session) = existing {
            if session.is_connected() {
                session.rebind(delegate);
                return Ok(session);
            }
            debug!("Conversation {id} lost its channel, reopening");
            self.sessions.remove(id);
            session.teardown().await;
        }

        let session = self.open_locked(id, user, delegate, options).await?;
        if let Err(e) = session.conversation().start().await {
            self.sessions
                .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
            self.recency.clear_if(id);
            session.teardown().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn open_locked(
        &self,
        id: &str,
        user: ConversationUser,
        delegate: Arc<dyn RpcObject>,
        options: ConversationOptions,
    ) -> Result<Arc<ConversationSession>, RpcError> {
        if let Some((_, previous)) = self.sessions.remove(id) {
            info!("Replacing conversation {id}");
            self.recency.clear_if(id);
            previous.teardown().await;
        }

        let assistant = self.assistant.assistant().await?;
        let delegate = Arc::new(SessionDelegate::new(
            id,
            delegate,
            Arc::clone(&self.recency),
        ));
        // Dropping the publication on any early return revokes the delegate.
        let publication = assistant.channel().publish_scoped(delegate.clone());
        let conversation = assistant
            .open_conversation(id, &user, publication.reference(), &options)
            .await?;

        let session = Arc::new(ConversationSession::new(
            id,
            user,
            conversation,
            delegate,
            publication,
        ));
        self.sessions.insert(id.to_string(), Arc::clone(&session));
        self.recency.touch(id);
        info!("Opened conversation {id}");
        Ok(session)
    }

    async fn close_locked(&self, id: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            debug!("Close for unknown conversation {id}");
            return;
        };
        self.recency.clear_if(id);

        if session.is_connected() {
            // The engine may already be gone; closing is best effort.
            match self.assistant.assistant().await {
                Ok(assistant) => {
                    if let Err(e) = assistant.close_conversation(id).await {
                        debug!("closeConversation({id}) failed: {e}");
                    }
                }
                Err(e) => debug!("Cannot close conversation {id} on the engine: {e}"),
            }
        }

        session.teardown().await;
        info!("Closed conversation {id}");
    }
}
