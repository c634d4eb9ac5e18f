use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::roles::Role;

/// Type of JWT: access or refresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[serde(alias = "Access")]
    Access,
    #[serde(alias = "Refresh")]
    Refresh,
}

/// JWT payload used for authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,      // user ID
    pub email: String,
    pub jti: Uuid,      // unique per issuance
    pub name: String,   // display name
    pub role: Role,
    /// Only present when the user has prescription access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescription_access: Option<bool>,
    pub iat: i64,       // issued at (unix timestamp)
    pub exp: i64,       // expires at (unix timestamp)
    pub iss: String,
    pub aud: String,
    pub kind: TokenKind,
}

impl Claims {
    pub fn has_prescription_access(&self) -> bool {
        self.prescription_access.unwrap_or(false)
    }
}
