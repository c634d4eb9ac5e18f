use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// User roles. Stored and serialized in lowercase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Customer,
    Pharmacist,
    Admin,
    #[serde(alias = "super_admin")]
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Pharmacist => "pharmacist",
            Role::Admin => "admin",
            Role::SuperAdmin => "superadmin",
        }
    }

    /// Counts towards last-admin protection.
    pub fn is_privileged(&self) -> bool {
        match self {
            Role::Admin | Role::SuperAdmin => true,
            Role::Customer | Role::Pharmacist => false,
        }
    }

    /// May list, edit and delete other users.
    pub fn can_manage_users(&self) -> bool {
        match self {
            Role::Admin | Role::SuperAdmin => true,
            Role::Customer | Role::Pharmacist => false,
        }
    }

    /// May move a user into or out of `target`.
    pub fn can_assign(&self, target: Role) -> bool {
        match (self, target) {
            (Role::SuperAdmin, _) => true,
            (Role::Admin, Role::SuperAdmin) => false,
            (Role::Admin, _) => true,
            (Role::Customer | Role::Pharmacist, _) => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "pharmacist" => Ok(Role::Pharmacist),
            "admin" => Ok(Role::Admin),
            "superadmin" | "super_admin" => Ok(Role::SuperAdmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}
