//! Authentication middleware.

use almond_protocol::ConversationUser;
use axum::{
    extract::{FromRequestParts, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Capability, Claims, DevUser, OAuthScope};

/// Lifetime of tokens minted by this service.
const TOKEN_LIFETIME_SECS: i64 = 3600 * 24;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Whether the request carries an `Authorization: Bearer` header.
pub fn has_bearer_token(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|h| bearer_token_from_header(h).is_ok())
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    /// Check if dev mode is enabled.
    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn dev_users(&self) -> &[DevUser] {
        &self.config.dev_users
    }

    /// Get allowed origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Whether a browser `Origin` header value may talk to this server.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        origin == "null" || self.config.allowed_origins.iter().any(|o| o == origin)
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode {
            // Check if this is a dev token (prefixed with "dev:")
            if let Some(user_id) = token.strip_prefix("dev:") {
                return self.get_dev_user_claims(user_id);
            }
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear(); // Allow missing iss/aud

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Get claims for a dev user.
    fn get_dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(AuthError::UserNotFound)?;

        let now = Utc::now().timestamp();
        Ok(Claims {
            iss: Some("dev".to_string()),
            iat: Some(now),
            email: user.email.clone(),
            name: Some(user.name.clone()),
            preferred_username: Some(user.id.clone()),
            caps: user.capabilities().bits(),
            ..Claims::for_subject(&user.id, now + TOKEN_LIFETIME_SECS)
        })
    }

    /// Sign a token for a user. `scope` limits it to OAuth scopes; `None`
    /// makes it a full session token.
    pub fn generate_token(
        &self,
        user_id: &str,
        name: &str,
        caps: Capability,
        scope: Option<&[OAuthScope]>,
    ) -> Result<String, AuthError> {
        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: Some("almond-cloud".to_string()),
            iat: Some(now),
            name: Some(name.to_string()),
            preferred_username: Some(user_id.to_string()),
            caps: caps.bits(),
            scope: scope.map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
            ..Claims::for_subject(user_id, now + TOKEN_LIFETIME_SECS)
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// User claims.
    pub claims: Claims,
}

impl CurrentUser {
    /// Get the user ID.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    /// Get display name.
    pub fn display_name(&self) -> &str {
        self.claims.display_name()
    }

    pub fn capabilities(&self) -> Capability {
        self.claims.capabilities()
    }

    /// Require every bit of `caps`.
    pub fn require_cap(&self, caps: Capability) -> Result<(), AuthError> {
        if self.capabilities().grants(caps) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions(format!(
                "requires {caps:?}"
            )))
        }
    }

    /// Require at least one bit of `caps`.
    pub fn require_any_cap(&self, caps: Capability) -> Result<(), AuthError> {
        if self.capabilities().grants_any(caps) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions(format!(
                "requires one of {caps:?}"
            )))
        }
    }

    /// Require an OAuth scope. Session logins carry every scope.
    pub fn require_scope(&self, scope: OAuthScope) -> Result<(), AuthError> {
        if self.claims.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::InvalidScope(scope.to_string()))
        }
    }

    /// Identity handed to the engine for conversations.
    pub fn conversation_user(&self) -> ConversationUser {
        ConversationUser::new(
            self.id(),
            self.display_name(),
            self.capabilities().grants(Capability::ADMIN),
        )
    }
}

/// Extract authentication from request.
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates JWT tokens and injects `CurrentUser` into request extensions.
/// Supports multiple auth methods in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (for WebSocket connections)
/// 4. X-Dev-User header (dev mode only)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    // Browsers cannot set headers on WebSocket upgrades; accept a cookie.
    let cookie_token = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, "auth_token"));

    let query_token = req.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next()?;
            if key == "token" {
                urlencoding::decode(value).ok().map(|s| s.into_owned())
            } else {
                None
            }
        })
    });

    let claims = if let Some(header) = auth_header {
        let token = bearer_token_from_header(header)?;
        auth.validate_token(token)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(ref token) = query_token {
        auth.validate_token(token)?
    } else if auth.is_dev_mode() {
        if let Some(user_id) = req
            .headers()
            .get("X-Dev-User")
            .and_then(|h| h.to_str().ok())
        {
            debug!("Using dev user: {}", user_id);
            auth.validate_token(&format!("dev:{}", user_id))?
        } else {
            return Err(AuthError::MissingAuthHeader);
        }
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    let user = CurrentUser { claims };
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

/// Require every capability bit in `CAPS`.
///
/// Use as an extractor: `RequireCap<{ Capability::MANAGE_DEVICES.bits() }>`.
#[derive(Debug, Clone)]
pub struct RequireCap<const CAPS: u32>(pub CurrentUser);

/// Require the admin capability.
pub type RequireAdmin = RequireCap<{ Capability::ADMIN.bits() }>;

impl<S, const CAPS: u32> FromRequestParts<S> for RequireCap<CAPS>
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)?;

        user.require_cap(Capability::from_bits_retain(CAPS))?;
        Ok(RequireCap(user))
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;
    use crate::auth::Role;

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn dev_user(id: &str, name: &str, roles: Vec<Role>, caps: Capability) -> DevUser {
        DevUser {
            id: id.to_string(),
            name: name.to_string(),
            email: Some(format!("{id}@localhost")),
            roles,
            caps,
        }
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        let cases = ["", "Bearer", "Bearer ", "Token something", "Bearer token extra"];

        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_from_cookie_header() {
        assert_eq!(
            token_from_cookie_header("a=1; auth_token=xyz; b=2", "auth_token"),
            Some("xyz")
        );
        assert_eq!(token_from_cookie_header("a=1", "auth_token"), None);
    }

    #[test]
    fn test_origin_check() {
        let state = AuthState::new(AuthConfig::default());
        assert!(state.is_origin_allowed("http://127.0.0.1:8080"));
        assert!(state.is_origin_allowed("null"));
        assert!(!state.is_origin_allowed("https://evil.example"));
    }

    #[test]
    fn test_generate_and_validate_token() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        let state = AuthState::new(config);

        let token = state
            .generate_token(
                "alice",
                "Alice",
                Capability::MANAGE_DEVICES,
                Some(&[OAuthScope::UserRead]),
            )
            .unwrap();

        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.capabilities(), Capability::MANAGE_DEVICES);
        assert!(claims.has_scope(OAuthScope::UserRead));
        assert!(!claims.has_scope(OAuthScope::UserExecCommand));

        assert!(matches!(
            state.validate_token("not-a-token"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_dev_token_validation() {
        let mut config = AuthConfig::default();
        config.dev_mode = true;
        config.dev_users = vec![dev_user(
            "root",
            "Root",
            vec![Role::SystemAdministrator],
            Capability::empty(),
        )];
        let state = AuthState::new(config);

        let claims = state.validate_token("dev:root").unwrap();
        assert_eq!(claims.sub, "root");
        assert_eq!(claims.capabilities(), Capability::ROOT);
        assert!(claims.scope.is_none());

        assert!(matches!(
            state.validate_token("dev:unknown"),
            Err(AuthError::UserNotFound)
        ));
    }

    #[test]
    fn test_dev_tokens_rejected_outside_dev_mode() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        config.dev_users = vec![dev_user("root", "Root", vec![], Capability::ROOT)];
        let state = AuthState::new(config);

        assert!(state.validate_token("dev:root").is_err());
    }

    #[test]
    fn test_current_user_checks() {
        let claims = Claims {
            name: Some("Test User".to_string()),
            caps: (Capability::ADMIN | Capability::MANAGE_DEVICES).bits(),
            scope: Some("user-read".to_string()),
            ..Claims::for_subject("user1", Utc::now().timestamp() + 3600)
        };
        let user = CurrentUser { claims };

        assert!(user.require_cap(Capability::MANAGE_DEVICES).is_ok());
        assert!(matches!(
            user.require_cap(Capability::MANAGE_USERS),
            Err(AuthError::InsufficientPermissions(_))
        ));
        assert!(user.require_any_cap(Capability::ALL_ADMIN).is_ok());
        assert!(user.require_scope(OAuthScope::UserRead).is_ok());
        assert!(matches!(
            user.require_scope(OAuthScope::UserExecCommand),
            Err(AuthError::InvalidScope(_))
        ));

        let conversation_user = user.conversation_user();
        assert_eq!(conversation_user.id, "user1");
        assert_eq!(conversation_user.name, "Test User");
        assert!(conversation_user.is_owner);
    }
}
