//! Authentication module.
//!
//! Provides JWT validation middleware with support for:
//! - HS256 session and OAuth access tokens
//! - Dev bypass mode with configurable test users
//!
//! Authorization is a capability bitmask ([`Capability`]) plus, for OAuth
//! tokens, a set of scopes ([`OAuthScope`]).

mod capability;
mod claims;
mod config;
mod error;
mod middleware;

pub use capability::{Capability, OAuthScope, Role};
pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError, DEFAULT_SERVER_ORIGIN, DevUser};
pub use error::AuthError;
pub use middleware::{
    AuthState, CurrentUser, RequireAdmin, RequireCap, auth_middleware, has_bearer_token,
};
