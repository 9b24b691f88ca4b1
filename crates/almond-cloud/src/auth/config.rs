//! Authentication configuration.

use serde::{Deserialize, Serialize};

use super::capability::{Capability, Role};

/// Origin the web front end is served from by default.
pub const DEFAULT_SERVER_ORIGIN: &str = "http://127.0.0.1:8080";

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable development mode (accept `dev:<id>` tokens and `X-Dev-User`).
    pub dev_mode: bool,

    /// JWT secret for HS256. Supports `env:VAR_NAME`.
    /// REQUIRED when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Development users (only used in dev mode).
    pub dev_users: Vec<DevUser>,

    /// Origins allowed to open sockets and make cross-origin requests.
    /// The literal `null` origin is always accepted.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            // No default JWT secret - must be explicitly configured
            jwt_secret: None,
            dev_users: Vec::new(),
            allowed_origins: vec![DEFAULT_SERVER_ORIGIN.to_string()],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    /// Returns the resolved secret or None if not configured.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    /// Validate the configuration.
    /// Returns an error if the configuration is invalid for the current mode.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.dev_mode {
            // In production mode, JWT secret is required
            let secret = self
                .resolve_jwt_secret()?
                .ok_or(ConfigValidationError::MissingJwtSecret)?;

            if secret.len() < 32 {
                return Err(ConfigValidationError::JwtSecretTooShort);
            }
        }

        Ok(())
    }

    /// Generate a random JWT secret.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// JWT secret is required in production mode.
    MissingJwtSecret,
    /// JWT secret is too short (minimum 32 characters).
    JwtSecretTooShort,
    /// Environment variable not found (for `env:VAR_NAME` syntax).
    EnvVarNotFound(String),
    /// Environment variable is empty (for `env:VAR_NAME` syntax).
    EnvVarEmpty(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingJwtSecret => {
                write!(
                    f,
                    "JWT secret is required when dev_mode is false. Set ALMOND_CLOUD__AUTH__JWT_SECRET or auth.jwt_secret in config."
                )
            }
            Self::JwtSecretTooShort => {
                write!(
                    f,
                    "JWT secret must be at least 32 characters long for security."
                )
            }
            Self::EnvVarNotFound(var) => {
                write!(
                    f,
                    "Environment variable '{}' not found (referenced via env:{} in config).",
                    var, var
                )
            }
            Self::EnvVarEmpty(var) => {
                write!(
                    f,
                    "Environment variable '{}' is empty (referenced via env:{} in config).",
                    var, var
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Development user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    /// User ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Named roles.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Extra capability bits, e.g. `"ADMIN | MANAGE_DEVICES"`.
    #[serde(default)]
    pub caps: Capability,
}

impl DevUser {
    /// Capabilities from the roles plus the extra bits.
    pub fn capabilities(&self) -> Capability {
        self.roles
            .iter()
            .fold(self.caps, |caps, role| caps | role.capabilities())
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_default() {
        let config = AuthConfig::default();
        assert!(!config.dev_mode);
        // No default JWT secret for security
        assert!(config.jwt_secret.is_none());
        assert!(config.dev_users.is_empty());
        assert_eq!(config.allowed_origins, vec!["http://127.0.0.1:8080"]);
    }

    #[test]
    fn test_config_validation_dev_mode() {
        let mut config = AuthConfig::default();
        config.dev_mode = true;
        // Dev mode should be valid without JWT secret
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_production_mode() {
        let mut config = AuthConfig::default();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigValidationError::MissingJwtSecret
        );

        config.jwt_secret = Some("tooshort".to_string());
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigValidationError::JwtSecretTooShort
        );

        config.jwt_secret = Some(AuthConfig::generate_jwt_secret());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_secret_missing() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some("env:ALMOND_CLOUD_TEST_SECRET_THAT_IS_NOT_SET".to_string());
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigValidationError::EnvVarNotFound(
                "ALMOND_CLOUD_TEST_SECRET_THAT_IS_NOT_SET".to_string()
            )
        );
    }

    #[test]
    fn test_generate_jwt_secret_length_and_charset() {
        let secret = AuthConfig::generate_jwt_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, AuthConfig::generate_jwt_secret());
    }

    #[test]
    fn test_dev_user_from_toml() {
        let user: DevUser = toml::from_str(
            r#"
            id = "alice"
            name = "Alice"
            roles = ["patient"]
            caps = "MANAGE_DEVICES"
            "#,
        )
        .unwrap();
        let caps = user.capabilities();
        assert!(caps.grants(Capability::MANAGE_DEVICES | Capability::MANAGE_OWN_COMMANDS));
        assert!(!caps.grants(Capability::ADMIN));
    }
}
