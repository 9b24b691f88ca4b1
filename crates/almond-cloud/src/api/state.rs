//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::backend::BackendClient;
use crate::conversation::ConversationManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Control channel to the engine.
    pub backend: BackendClient,
    /// Conversations opened by browser sockets.
    pub conversations: Arc<ConversationManager>,
    /// Authentication state.
    pub auth: AuthState,
}

impl AppState {
    /// Create new application state.
    ///
    /// Conversations resolve the assistant through `backend`, so they see
    /// every reconnect.
    pub fn new(backend: BackendClient, auth: AuthState) -> Self {
        let conversations = Arc::new(ConversationManager::new(Arc::new(backend.clone())));
        Self {
            backend,
            conversations,
            auth,
        }
    }
}
