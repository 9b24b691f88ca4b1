//! HTTP handlers for the engine surface.

use almond_protocol::{AppInfo, DeviceInfo, OAuth2Start};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::auth::{Capability, CurrentUser, OAuthScope, RequireAdmin, RequireCap};
use crate::backend::{AssistantProvider, ConnectionStatus, EngineControl};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Extractor for routes that manage the engine's devices.
pub type RequireDeviceManager = RequireCap<{ Capability::MANAGE_DEVICES.bits() }>;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: ConnectionStatus,
    pub conversations: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.backend.status(),
        conversations: state.conversations.len(),
    })
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub result: &'static str,
}

impl OkResponse {
    fn ok() -> Json<Self> {
        Json(Self { result: "ok" })
    }
}

/// List the user's running apps.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn list_apps(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<AppInfo>>> {
    user.require_scope(OAuthScope::UserRead)?;
    Ok(Json(state.backend.get_all_apps().await?))
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn get_app(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(app_id): Path<String>,
) -> ApiResult<Json<AppInfo>> {
    user.require_scope(OAuthScope::UserRead)?;
    state
        .backend
        .get_app(&app_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No such app"))
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn delete_app(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(app_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    if !state.backend.delete_app(&app_id).await? {
        return Err(ApiError::not_found("No such app"));
    }
    info!("Deleted app {}", app_id);
    Ok(OkResponse::ok())
}

/// Create an app from a program.
///
/// The engine's answer is returned as is; when it reports an error the
/// status is 400.
#[instrument(skip(state, user, params), fields(user = %user.id()))]
pub async fn create_app(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(params): Json<Value>,
) -> ApiResult<Response> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    let assistant = state.backend.assistant().await?;
    let result = assistant.create_app(params).await?;

    let failed = result.get("error").is_some_and(|e| !e.is_null());
    let status = if failed {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ParseQuery {
    pub q: Option<String>,
    pub target_json: Option<String>,
}

/// Parse an utterance without running it.
#[instrument(skip(state, user, query), fields(user = %user.id()))]
pub async fn parse(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ParseQuery>,
) -> ApiResult<Json<Value>> {
    user.require_scope(OAuthScope::UserRead)?;
    let sentence = query.q.unwrap_or_default();
    if sentence.is_empty() && query.target_json.is_none() {
        return Err(ApiError::bad_request("Missing query"));
    }

    let assistant = state.backend.assistant().await?;
    Ok(Json(
        assistant
            .parse(&sentence, query.target_json.as_deref())
            .await?,
    ))
}

/// List configured devices, minus the engine itself.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn list_devices(
    State(state): State<AppState>,
    RequireCap(user): RequireDeviceManager,
) -> ApiResult<Json<Vec<DeviceInfo>>> {
    user.require_scope(OAuthScope::UserRead)?;
    let devices = state
        .backend
        .get_all_devices()
        .await?
        .into_iter()
        .filter(|d| !d.is_thing_engine)
        .collect();
    Ok(Json(devices))
}

#[instrument(skip(state, user, body), fields(user = %user.id()))]
pub async fn create_device(
    State(state): State<AppState>,
    RequireCap(user): RequireDeviceManager,
    Json(body): Json<Value>,
) -> ApiResult<Json<OkResponse>> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    match body.get("kind").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => info!("Configuring device of kind {}", kind),
        _ => return Err(ApiError::bad_request("You must choose one kind of device")),
    }

    state.backend.add_device(body).await?;
    Ok(OkResponse::ok())
}

#[derive(Debug, Deserialize)]
pub struct DeleteDeviceRequest {
    pub id: String,
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn delete_device(
    State(state): State<AppState>,
    RequireCap(user): RequireDeviceManager,
    Json(request): Json<DeleteDeviceRequest>,
) -> ApiResult<Json<OkResponse>> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    if !state.backend.delete_device(&request.id).await? {
        return Err(ApiError::not_found("Not found."));
    }
    Ok(OkResponse::ok())
}

/// Begin an OAuth2 device configuration. The caller follows `redirect` and
/// hands `session` back to the callback.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn start_oauth2(
    State(state): State<AppState>,
    RequireCap(user): RequireDeviceManager,
    Path(kind): Path<String>,
) -> ApiResult<Json<OAuth2Start>> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    Ok(Json(state.backend.start_oauth2(&kind).await?))
}

#[derive(Debug, Deserialize)]
pub struct OAuth2CallbackRequest {
    pub redirect_uri: String,
    #[serde(default)]
    pub session: Value,
}

#[instrument(skip(state, user, request), fields(user = %user.id()))]
pub async fn oauth2_callback(
    State(state): State<AppState>,
    RequireCap(user): RequireDeviceManager,
    Path(kind): Path<String>,
    Json(request): Json<OAuth2CallbackRequest>,
) -> ApiResult<Json<OkResponse>> {
    user.require_scope(OAuthScope::UserExecCommand)?;
    state
        .backend
        .handle_oauth2_callback(&kind, &request.redirect_uri, request.session)
        .await?;
    Ok(OkResponse::ok())
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub connected: bool,
}

/// List open conversations (admin only).
pub async fn list_conversations(
    State(state): State<AppState>,
    RequireCap(_user): RequireAdmin,
) -> Json<Vec<ConversationSummary>> {
    let summaries = state
        .conversations
        .ids()
        .into_iter()
        .filter_map(|id| state.conversations.get(Some(&id)).filter(|s| s.id() == id))
        .map(|session| ConversationSummary {
            id: session.id().to_string(),
            user_id: session.user().id.clone(),
            created_at: session.created_at(),
            active: session.is_active(),
            connected: session.is_connected(),
        })
        .collect();
    Json(summaries)
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    /// Deliver through `notifyError` instead of `notify`.
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Serialize)]
pub struct BroadcastOutcome {
    pub conversation_id: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notify every open conversation (admin only).
#[instrument(skip(state, user, request), fields(user = %user.id()))]
pub async fn broadcast(
    State(state): State<AppState>,
    RequireCap(user): RequireAdmin,
    Json(request): Json<BroadcastRequest>,
) -> Json<Vec<BroadcastOutcome>> {
    let outcomes = if request.error {
        state.conversations.notify_error_all(request.args).await
    } else {
        state.conversations.notify_all(request.args).await
    };

    Json(
        outcomes
            .into_iter()
            .map(|outcome| BroadcastOutcome {
                conversation_id: outcome.session_id,
                delivered: outcome.result.is_ok(),
                error: outcome.result.err().map(|e| e.to_string()),
            })
            .collect(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    /// OAuth scopes to narrow the token to. Omitted means a full token.
    #[serde(default)]
    pub scope: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Sign a token for the calling user, e.g. for a browser socket.
///
/// A scoped caller can only mint tokens within its own scopes.
#[instrument(skip(state, user, request), fields(user = %user.id()))]
pub async fn issue_token(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let scopes = request
        .scope
        .map(|names| {
            names
                .iter()
                .map(|name| {
                    name.parse::<OAuthScope>()
                        .map_err(|_| ApiError::bad_request(format!("unknown scope: {name}")))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    match &scopes {
        Some(scopes) => {
            for scope in scopes {
                user.require_scope(*scope)?;
            }
        }
        None if user.claims.scope.is_some() => {
            return Err(ApiError::forbidden("scoped tokens cannot mint full tokens"));
        }
        None => {}
    }

    let token = state.auth.generate_token(
        user.id(),
        user.display_name(),
        user.capabilities(),
        scopes.as_deref(),
    )?;
    Ok(Json(TokenResponse { token }))
}
