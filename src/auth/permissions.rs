// src/auth/permissions.rs

//! Roles and the permissions they grant
//!
//! [`Role::permissions`] is the only place that decides what a role may do.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ChannelRead,
    PackageRead,
    NamespaceCreate,
    NamespaceRead,
    NamespaceUpdate,
    NamespaceDelete,
    NamespaceRoleMappingCreate,
    NamespaceRoleMappingRead,
    NamespaceRoleMappingUpdate,
    NamespaceRoleMappingDelete,
    EnvironmentCreate,
    EnvironmentRead,
    EnvironmentUpdate,
    EnvironmentDelete,
    EnvironmentSolve,
    BuildCancel,
    BuildDelete,
    SettingRead,
    SettingUpdate,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ChannelRead => "CHANNEL_READ",
            Permission::PackageRead => "PACKAGE_READ",
            Permission::NamespaceCreate => "NAMESPACE_CREATE",
            Permission::NamespaceRead => "NAMESPACE_READ",
            Permission::NamespaceUpdate => "NAMESPACE_UPDATE",
            Permission::NamespaceDelete => "NAMESPACE_DELETE",
            Permission::NamespaceRoleMappingCreate => "NAMESPACE_ROLE_MAPPING_CREATE",
            Permission::NamespaceRoleMappingRead => "NAMESPACE_ROLE_MAPPING_READ",
            Permission::NamespaceRoleMappingUpdate => "NAMESPACE_ROLE_MAPPING_UPDATE",
            Permission::NamespaceRoleMappingDelete => "NAMESPACE_ROLE_MAPPING_DELETE",
            Permission::EnvironmentCreate => "ENVIRONMENT_CREATE",
            Permission::EnvironmentRead => "ENVIRONMENT_READ",
            Permission::EnvironmentUpdate => "ENVIRONMENT_UPDATE",
            Permission::EnvironmentDelete => "ENVIRONMENT_DELETE",
            Permission::EnvironmentSolve => "ENVIRONMENT_SOLVE",
            Permission::BuildCancel => "BUILD_CANCEL",
            Permission::BuildDelete => "BUILD_DELETE",
            Permission::SettingRead => "SETTING_READ",
            Permission::SettingUpdate => "SETTING_UPDATE",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VIEWER: &[Permission] = &[
    Permission::ChannelRead,
    Permission::PackageRead,
    Permission::NamespaceRead,
    Permission::NamespaceRoleMappingRead,
    Permission::EnvironmentRead,
    Permission::SettingRead,
];

const DEVELOPER: &[Permission] = &[
    Permission::ChannelRead,
    Permission::PackageRead,
    Permission::NamespaceRead,
    Permission::NamespaceRoleMappingRead,
    Permission::EnvironmentRead,
    Permission::SettingRead,
    Permission::EnvironmentCreate,
    Permission::EnvironmentUpdate,
    Permission::EnvironmentSolve,
    Permission::BuildCancel,
];

const ADMIN: &[Permission] = &[
    Permission::ChannelRead,
    Permission::PackageRead,
    Permission::NamespaceRead,
    Permission::NamespaceRoleMappingRead,
    Permission::EnvironmentRead,
    Permission::SettingRead,
    Permission::EnvironmentCreate,
    Permission::EnvironmentUpdate,
    Permission::EnvironmentSolve,
    Permission::BuildCancel,
    Permission::BuildDelete,
    Permission::EnvironmentDelete,
    Permission::NamespaceCreate,
    Permission::NamespaceUpdate,
    Permission::NamespaceDelete,
    Permission::NamespaceRoleMappingCreate,
    Permission::NamespaceRoleMappingUpdate,
    Permission::NamespaceRoleMappingDelete,
    Permission::SettingUpdate,
];

/// Role named in a binding; `editor` is accepted as an alias of `developer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Developer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Developer => "developer",
            Role::Admin => "admin",
        }
    }

    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Role::Viewer => VIEWER,
            Role::Developer => DEVELOPER,
            Role::Admin => ADMIN,
        }
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    /// Canonical spelling of a role name; errors on unknown roles
    pub fn normalize(name: &str) -> Result<String> {
        name.parse::<Role>()
            .map(|role| role.as_str().to_string())
            .map_err(Error::Validation)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "developer" | "editor" => Ok(Role::Developer),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {s}; expected viewer, developer or admin")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_nested() {
        for permission in VIEWER {
            assert!(Role::Developer.grants(*permission));
        }
        for permission in DEVELOPER {
            assert!(Role::Admin.grants(*permission));
        }
        assert!(!Role::Viewer.grants(Permission::EnvironmentCreate));
        assert!(!Role::Developer.grants(Permission::BuildDelete));
        assert!(Role::Admin.grants(Permission::SettingUpdate));
    }

    #[test]
    fn test_editor_alias() {
        assert_eq!("editor".parse::<Role>().unwrap(), Role::Developer);
        assert_eq!(Role::normalize("editor").unwrap(), "developer");
        assert!(Role::normalize("owner").is_err());
    }

    #[test]
    fn test_permission_names() {
        assert_eq!(Permission::NamespaceRoleMappingRead.as_str(), "NAMESPACE_ROLE_MAPPING_READ");
        assert_eq!(
            serde_json::to_string(&Permission::EnvironmentSolve).unwrap(),
            "\"ENVIRONMENT_SOLVE\""
        );
    }
}
