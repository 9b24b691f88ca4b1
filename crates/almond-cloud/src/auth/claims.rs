//! JWT claims.

use serde::{Deserialize, Serialize};

use super::capability::{Capability, OAuthScope, Role};

/// JWT claims structure.
///
/// A token without `scope` belongs to a full login session. A token with
/// `scope` is an OAuth access token limited to the listed scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Audience.
    #[serde(default)]
    pub aud: Option<Vec<String>>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// JWT ID.
    #[serde(default)]
    pub jti: Option<String>,

    /// User's email.
    #[serde(default)]
    pub email: Option<String>,

    /// User's name.
    #[serde(default)]
    pub name: Option<String>,

    /// User's preferred username.
    #[serde(default)]
    pub preferred_username: Option<String>,

    /// Capability bits granted directly.
    #[serde(default)]
    pub caps: u32,

    /// Named roles; their capability sets are added to `caps`.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Space-separated OAuth scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Claims {
    /// Claims for `sub` with nothing else set.
    pub fn for_subject(sub: impl Into<String>, exp: i64) -> Self {
        Self {
            sub: sub.into(),
            iss: None,
            aud: None,
            exp,
            iat: None,
            jti: None,
            email: None,
            name: None,
            preferred_username: None,
            caps: 0,
            roles: Vec::new(),
            scope: None,
        }
    }

    /// Effective capabilities. Unknown bits and role names grant nothing.
    pub fn capabilities(&self) -> Capability {
        self.roles
            .iter()
            .filter_map(|role| role.parse::<Role>().ok())
            .fold(Capability::from_bits_truncate(self.caps), |caps, role| {
                caps | role.capabilities()
            })
    }

    /// Check if the user is the owner of their engine.
    pub fn is_admin(&self) -> bool {
        self.capabilities().grants(Capability::ADMIN)
    }

    /// Whether the token may be used for `scope`.
    pub fn has_scope(&self, scope: OAuthScope) -> bool {
        match &self.scope {
            None => true,
            Some(granted) => granted.split_whitespace().any(|s| s == scope.as_str()),
        }
    }

    /// Get the display name for the user.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.preferred_username.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }
}
