//! Browser WebSocket endpoints.
//!
//! `/api/results` streams the user's notifications; `/api/conversation`
//! opens a conversation with the engine for the lifetime of the socket.
//! Both publish a delegate on the control channel that writes into the
//! socket, and tear it down when the socket closes.

use std::sync::Arc;
use std::time::Duration;

use almond_protocol::{ClientCommand, ConversationOptions, ServerMessage};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header::ORIGIN},
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ApiError;
use super::state::AppState;
use crate::auth::{AuthError, AuthState, CurrentUser, OAuthScope, has_bearer_token};
use crate::backend::{AssistantProvider, ConversationProxy};
use crate::delegate::{AssistantDelegate, ChannelSink, EventSink, ResultsDelegate};
use crate::rpc::RpcError;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// How long a failing socket gets to deliver its last error.
const ERROR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Reject cross-site socket upgrades.
///
/// Requests authenticated with a bearer header are not ambient credentials
/// and skip the check, as do requests without an `Origin`.
fn check_origin(auth: &AuthState, headers: &HeaderMap) -> Result<(), AuthError> {
    if has_bearer_token(headers) {
        return Ok(());
    }
    match headers.get(ORIGIN).map(|h| h.to_str()) {
        None => Ok(()),
        Some(Ok(origin)) if auth.is_origin_allowed(origin) => Ok(()),
        Some(Ok(origin)) => Err(AuthError::OriginNotAllowed(origin.to_string())),
        Some(Err(_)) => Err(AuthError::OriginNotAllowed("<invalid>".to_string())),
    }
}

/// Conversation id for one browser socket.
fn conversation_id(user_id: &str) -> String {
    format!(
        "enterprise:{}:{}",
        user_id,
        hex::encode(rand::random::<[u8; 4]>())
    )
}

/// Forward queued frames to the socket until either side goes away.
fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    })
}

/// WebSocket upgrade handler for notifications.
///
/// GET /api/results
pub async fn results_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    user.require_scope(OAuthScope::UserReadResults)?;
    check_origin(&state.auth, &headers)?;
    let assistant = state.backend.assistant().await?;

    info!("Results socket opened for user {}", user.id());
    Ok(ws.on_upgrade(move |socket| async move {
        let (sender, mut receiver) = socket.split();
        let (sink, rx) = ChannelSink::new();
        let writer = spawn_writer(sender, rx);

        let delegate = Arc::new(ResultsDelegate::new(Arc::new(sink)));
        let mut publication = assistant.channel().publish_scoped(delegate);

        if let Err(e) = assistant.add_output(publication.reference()).await {
            warn!("Failed to subscribe results for user {}: {}", user.id(), e);
            writer.abort();
            return;
        }

        // Output only; drain until the browser goes away.
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Results socket error for user {}: {}", user.id(), e);
                    break;
                }
            }
        }

        let removed = if assistant.is_connected() {
            assistant.remove_output(publication.reference()).await
        } else {
            Ok(())
        };
        if let Err(e) = removed {
            debug!("removeOutput failed for user {}: {}", user.id(), e);
        }
        publication.release();
        writer.abort();
        info!("Results socket closed for user {}", user.id());
    }))
}

/// WebSocket upgrade handler for conversations.
///
/// GET /api/conversation
pub async fn conversation_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    check_origin(&state.auth, &headers)?;

    Ok(ws.on_upgrade(move |socket| handle_conversation_socket(socket, state, user)))
}

async fn handle_conversation_socket(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (sender, mut receiver) = socket.split();
    let (sink, rx) = ChannelSink::new();
    let mut writer = spawn_writer(sender, rx);

    let id = conversation_id(user.id());
    let delegate = Arc::new(AssistantDelegate::new(Arc::new(sink.clone())));
    let options = ConversationOptions { show_welcome: true };

    let session = match state
        .conversations
        .open(&id, user.conversation_user(), delegate, options)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!("Failed to open conversation {}: {}", id, e);
            send_error(&sink, e.to_string()).await;
            drop(sink);
            let _ = tokio::time::timeout(ERROR_FLUSH_TIMEOUT, &mut writer).await;
            writer.abort();
            return;
        }
    };
    info!("Conversation {} opened for user {}", id, user.id());

    // The browser may have left while the engine was opening the conversation.
    if writer.is_finished() {
        state.conversations.close(&id).await;
        writer.abort();
        return;
    }

    if let Err(e) = session.conversation().start().await {
        warn!("Failed to start conversation {}: {}", id, e);
        send_error(&sink, e.to_string()).await;
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let result = match ClientCommand::parse(text.as_str()) {
                    Ok(command) => dispatch(session.conversation(), command)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(error) = result {
                    debug!("Command on conversation {} failed: {}", id, error);
                    send_error(&sink, error).await;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message on conversation {}, ignoring", id);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Conversation socket {} error: {}", id, e);
                break;
            }
        }
    }

    state.conversations.close(&id).await;
    writer.abort();
    info!("Conversation {} closed", id);
}

async fn dispatch(conversation: &ConversationProxy, command: ClientCommand) -> Result<(), RpcError> {
    match command {
        ClientCommand::Command { text } => conversation.handle_command(&text).await,
        ClientCommand::Parsed { json } => conversation.handle_parsed_command(json).await,
        ClientCommand::Tt { code } => conversation.handle_thingtalk(&code).await,
    }
}

async fn send_error(sink: &ChannelSink, error: String) {
    let message = ServerMessage::Error { error };
    match serde_json::to_string(&message) {
        Ok(json) => {
            let _ = sink.send_text(json).await;
        }
        Err(e) => warn!("Failed to serialize error message: {}", e),
    }
}
