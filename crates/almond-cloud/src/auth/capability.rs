//! Capability bitmask, named roles and OAuth scopes.
//!
//! Bit values are part of the stored data and never change meaning. Roles
//! are only names for sets of bits; every check is a bitwise test.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Permissions granted to a user.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Capability: u32 {
        const ADMIN = 1 << 0;
        const MANAGE_DEVICES = 1 << 1;
        const MANAGE_USERS = 1 << 2;
        const MANAGE_ALL_PERMISSIONS = 1 << 3;
        const MANAGE_OWN_PERMISSIONS = 1 << 4;
        const MANAGE_ALL_COMMANDS = 1 << 5;
        const MANAGE_OWN_COMMANDS = 1 << 6;
        const RUN_UNRESTRICTED_COMMANDS = 1 << 7;

        /// Anything that opens an admin page.
        const ALL_ADMIN = Self::ADMIN.bits()
            | Self::MANAGE_USERS.bits()
            | Self::MANAGE_DEVICES.bits()
            | Self::MANAGE_ALL_PERMISSIONS.bits()
            | Self::MANAGE_ALL_COMMANDS.bits();

        const ROOT = Self::ALL_ADMIN.bits()
            | Self::MANAGE_OWN_PERMISSIONS.bits()
            | Self::MANAGE_OWN_COMMANDS.bits()
            | Self::RUN_UNRESTRICTED_COMMANDS.bits();
    }
}

impl Capability {
    /// Translate the old two-bit role value (admin = 1, manage devices = 2,
    /// both = root).
    pub fn from_legacy_role(bits: u32) -> Self {
        const LEGACY_ADMIN: u32 = 1;
        const LEGACY_MANAGE_DEVICES: u32 = 2;

        if bits & (LEGACY_ADMIN | LEGACY_MANAGE_DEVICES) == LEGACY_ADMIN | LEGACY_MANAGE_DEVICES {
            return Self::ROOT;
        }
        let mut caps = Self::empty();
        if bits & LEGACY_ADMIN != 0 {
            caps |= Self::ALL_ADMIN.difference(Self::MANAGE_DEVICES);
        }
        if bits & LEGACY_MANAGE_DEVICES != 0 {
            caps |= Self::MANAGE_DEVICES;
        }
        caps
    }

    /// Every bit of `required` is granted.
    pub fn grants(self, required: Self) -> bool {
        self.contains(required)
    }

    /// At least one bit of `any` is granted.
    pub fn grants_any(self, any: Self) -> bool {
        self.intersects(any)
    }
}

/// Named capability sets users are assigned to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// No extra permissions.
    #[default]
    User,
    Patient,
    Researcher,
    SystemAdministrator,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::User,
        Role::Patient,
        Role::Researcher,
        Role::SystemAdministrator,
    ];

    pub fn capabilities(self) -> Capability {
        match self {
            Role::User => Capability::empty(),
            Role::Patient => {
                Capability::MANAGE_OWN_PERMISSIONS
                    | Capability::MANAGE_OWN_COMMANDS
                    | Capability::RUN_UNRESTRICTED_COMMANDS
            }
            Role::Researcher => Capability::MANAGE_OWN_COMMANDS,
            Role::SystemAdministrator => Capability::ROOT,
        }
    }

    /// Whether users may pick this role when signing up.
    pub fn can_register(self) -> bool {
        matches!(self, Role::Patient | Role::Researcher)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Patient => "Patient",
            Role::Researcher => "Researcher",
            Role::SystemAdministrator => "System Administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "user" => Ok(Role::User),
            "patient" => Ok(Role::Patient),
            "researcher" => Ok(Role::Researcher),
            "system administrator" | "root" => Ok(Role::SystemAdministrator),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Scopes an OAuth access token can be limited to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthScope {
    /// See the user's profile.
    Profile,
    /// Read active commands and devices.
    UserRead,
    /// Read results of active commands.
    UserReadResults,
    /// Execute commands, including the web assistant.
    UserExecCommand,
}

impl OAuthScope {
    pub const ALL: [OAuthScope; 4] = [
        OAuthScope::Profile,
        OAuthScope::UserRead,
        OAuthScope::UserReadResults,
        OAuthScope::UserExecCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OAuthScope::Profile => "profile",
            OAuthScope::UserRead => "user-read",
            OAuthScope::UserReadResults => "user-read-results",
            OAuthScope::UserExecCommand => "user-exec-command",
        }
    }
}

impl fmt::Display for OAuthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("unknown scope: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values_are_stable() {
        assert_eq!(Capability::ADMIN.bits(), 1);
        assert_eq!(Capability::MANAGE_DEVICES.bits(), 2);
        assert_eq!(Capability::MANAGE_USERS.bits(), 4);
        assert_eq!(Capability::RUN_UNRESTRICTED_COMMANDS.bits(), 128);
        assert_eq!(Capability::ROOT.bits(), 0xff);
        assert_eq!(Capability::ALL_ADMIN.bits(), 0b10_1111);
    }

    #[test]
    fn test_grants() {
        let caps = Capability::MANAGE_DEVICES | Capability::MANAGE_OWN_COMMANDS;
        assert!(caps.grants(Capability::MANAGE_DEVICES));
        assert!(!caps.grants(Capability::MANAGE_DEVICES | Capability::ADMIN));
        assert!(caps.grants_any(Capability::ALL_ADMIN));
        assert!(!Capability::empty().grants_any(Capability::ALL_ADMIN));
        assert!(Capability::ROOT.grants(Capability::ALL_ADMIN));
    }

    #[test]
    fn test_legacy_roles() {
        assert_eq!(Capability::from_legacy_role(3), Capability::ROOT);
        assert_eq!(Capability::from_legacy_role(2), Capability::MANAGE_DEVICES);
        let admin = Capability::from_legacy_role(1);
        assert!(admin.grants(Capability::ADMIN | Capability::MANAGE_USERS));
        assert!(!admin.grants(Capability::MANAGE_DEVICES));
        assert_eq!(Capability::from_legacy_role(0), Capability::empty());
    }

    #[test]
    fn test_roles_are_capability_sets() {
        assert_eq!(Role::SystemAdministrator.capabilities(), Capability::ROOT);
        assert!(Role::Patient
            .capabilities()
            .grants(Capability::RUN_UNRESTRICTED_COMMANDS));
        assert!(Role::Researcher.can_register());
        assert!(!Role::SystemAdministrator.can_register());
        assert_eq!(
            "System Administrator".parse::<Role>().unwrap(),
            Role::SystemAdministrator
        );
        assert_eq!("system_administrator".parse::<Role>().unwrap(), Role::SystemAdministrator);
        assert!("wizard".parse::<Role>().is_err());
    }

    #[test]
    fn test_capability_names_in_config() {
        #[derive(Deserialize)]
        struct Holder {
            caps: Capability,
        }
        let holder: Holder = toml::from_str(r#"caps = "ADMIN | MANAGE_DEVICES""#).unwrap();
        assert_eq!(holder.caps, Capability::ADMIN | Capability::MANAGE_DEVICES);
    }

    #[test]
    fn test_scope_names() {
        for scope in OAuthScope::ALL {
            assert_eq!(scope.as_str().parse::<OAuthScope>().unwrap(), scope);
        }
        assert!("admin".parse::<OAuthScope>().is_err());
    }
}
