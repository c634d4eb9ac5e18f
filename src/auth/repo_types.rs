use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{password::HashedPassword, roles::Role};

/// Row as stored in the `users` table.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub role: String,
    pub prescription_access: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
    pub reset_password_token: Option<String>,
    pub reset_password_token_expiry: Option<OffsetDateTime>,
}

/// User record in the credential store.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: HashedPassword,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub role: Role,
    pub prescription_access: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
    pub reset_password_token: Option<String>,
    pub reset_password_token_expiry: Option<OffsetDateTime>,
}

impl User {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        let role = r
            .role
            .parse::<Role>()
            .map_err(|e| anyhow::anyhow!("user {}: {e}", r.id))?;
        Ok(Self {
            id: r.id,
            email: r.email,
            password_hash: HashedPassword::from_stored(r.password_hash),
            first_name: r.first_name,
            last_name: r.last_name,
            phone_number: r.phone_number,
            role,
            prescription_access: r.prescription_access,
            created_at: r.created_at,
            last_login_at: r.last_login_at,
            reset_password_token: r.reset_password_token,
            reset_password_token_expiry: r.reset_password_token_expiry,
        })
    }
}

/// Input for inserting a user. The email must already be normalized.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: HashedPassword,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub role: Role,
    pub prescription_access: bool,
}

/// Self-service profile fields. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
}

/// Admin edit of another user.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub profile: ProfileUpdate,
    pub role: Option<Role>,
    pub prescription_access: Option<bool>,
}

#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(User),
    NotFound,
    /// The change would demote the only remaining admin.
    LastAdmin,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    LastAdmin,
}

pub(crate) const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, \
     phone_number, role, prescription_access, created_at, last_login_at, \
     reset_password_token, reset_password_token_expiry";
