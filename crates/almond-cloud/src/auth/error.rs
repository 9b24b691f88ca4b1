//! Why a request was refused before it reached the engine.
//!
//! Route handlers usually convert these into [`crate::api::ApiError`]; the
//! `IntoResponse` impl here is for extractors that reject on their own,
//! such as the socket origin check.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No bearer token, session cookie or dev-user header.
    #[error("no credentials supplied")]
    MissingAuthHeader,

    /// `Authorization` present but not `Bearer <token>`.
    #[error("authorization header is not a bearer token")]
    InvalidAuthHeader,

    #[error("access token rejected: {0}")]
    InvalidToken(String),

    #[error("access token has expired")]
    TokenExpired,

    /// The user lacks a capability the route needs.
    #[error("missing capability: {0}")]
    InsufficientPermissions(String),

    /// The token was issued without this OAuth scope.
    #[error("token lacks scope {0}")]
    InvalidScope(String),

    /// Socket upgrade from a page served by another origin.
    #[error("cross-site request from {0}")]
    OriginNotAllowed(String),

    /// The token names a user this instance does not know.
    #[error("unknown user")]
    UserNotFound,

    #[error("authentication unavailable: {0}")]
    Internal(String),
}

impl AuthError {
    /// HTTP status and the stable `error_code` sent to clients.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingAuthHeader => (StatusCode::UNAUTHORIZED, "missing_auth_header"),
            Self::InvalidAuthHeader => (StatusCode::UNAUTHORIZED, "invalid_auth_header"),
            Self::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
            Self::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
            Self::InsufficientPermissions(_) => (StatusCode::FORBIDDEN, "insufficient_permissions"),
            Self::InvalidScope(_) => (StatusCode::FORBIDDEN, "invalid_scope"),
            Self::OriginNotAllowed(_) => (StatusCode::FORBIDDEN, "origin_not_allowed"),
            Self::UserNotFound => (StatusCode::NOT_FOUND, "user_not_found"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub error_code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        let body = AuthErrorResponse {
            error: self.to_string(),
            error_code,
        };
        (status, Json(body)).into_response()
    }
}
