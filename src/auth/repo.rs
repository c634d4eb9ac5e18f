use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    password::HashedPassword,
    repo_types::{
        DeleteOutcome, NewUser, ProfileUpdate, UpdateOutcome, User, UserRow, UserUpdate,
        USER_COLUMNS,
    },
    roles::Role,
};

/// Persistence for users and issued refresh tokens.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    /// Returns `None` when the email is already taken.
    async fn create(&self, new: NewUser) -> anyhow::Result<Option<User>>;
    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()>;
    async fn set_password(&self, id: Uuid, hash: &HashedPassword) -> anyhow::Result<()>;
    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> anyhow::Result<()>;
    /// Swaps in `hash` and clears the reset token if `token` matches and is
    /// unexpired at `now`. An expired token is cleared either way.
    async fn complete_password_reset(
        &self,
        email: &str,
        token: &str,
        now: OffsetDateTime,
        hash: &HashedPassword,
    ) -> anyhow::Result<bool>;
    async fn update_profile(&self, id: Uuid, update: ProfileUpdate)
        -> anyhow::Result<Option<User>>;
    async fn update_user(&self, id: Uuid, update: UserUpdate) -> anyhow::Result<UpdateOutcome>;
    async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>>;
    async fn delete_user(&self, id: Uuid) -> anyhow::Result<DeleteOutcome>;

    async fn store_refresh_token(
        &self,
        jti: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
    async fn consume_refresh_token(
        &self,
        jti: Uuid,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<Uuid>>;
    async fn revoke_refresh_tokens(&self, user_id: Uuid) -> anyhow::Result<()>;
}

fn privileged_roles() -> Vec<String> {
    [Role::Customer, Role::Pharmacist, Role::Admin, Role::SuperAdmin]
        .into_iter()
        .filter(Role::is_privileged)
        .map(|r| r.as_str().to_string())
        .collect()
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Locks every privileged row in a stable order so concurrent
    /// delete/demote transactions serialize on the same set.
    async fn lock_privileged(tx: &mut Transaction<'_, Postgres>) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
              FROM users
             WHERE role = ANY($1)
             ORDER BY id
               FOR UPDATE
            "#,
        )
        .bind(privileged_roles())
        .fetch_all(&mut **tx)
        .await
        .context("lock privileged users")?;
        Ok(ids)
    }

    async fn lock_role(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> anyhow::Result<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            r#"SELECT role FROM users WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("lock user row")?;
        role.map(|r| r.parse::<Role>().map_err(anyhow::Error::from))
            .transpose()
    }
}

fn into_user(row: Option<UserRow>) -> anyhow::Result<Option<User>> {
    row.map(User::try_from).transpose()
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        into_user(row)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        into_user(row)
    }

    async fn create(&self, new: NewUser) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (email, password_hash, first_name, last_name,
                               phone_number, role, prescription_access)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new.email)
        .bind(new.password_hash.as_str())
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.phone_number)
        .bind(new.role.as_str())
        .bind(new.prescription_access)
        .fetch_optional(&self.db)
        .await
        .context("insert user")?;
        into_user(row)
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET last_login_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db)
            .await
            .context("record login")?;
        Ok(())
    }

    async fn set_password(&self, id: Uuid, hash: &HashedPassword) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(hash.as_str())
            .execute(&self.db)
            .await
            .context("set password")?;
        Ok(())
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET reset_password_token = $2,
                   reset_password_token_expiry = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(expiry)
        .execute(&self.db)
        .await
        .context("set reset token")?;
        Ok(())
    }

    async fn complete_password_reset(
        &self,
        email: &str,
        token: &str,
        now: OffsetDateTime,
        hash: &HashedPassword,
    ) -> anyhow::Result<bool> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE users
               SET password_hash = $4,
                   reset_password_token = NULL,
                   reset_password_token_expiry = NULL
             WHERE lower(email) = lower($1)
               AND reset_password_token = $2
               AND reset_password_token_expiry > $3
            RETURNING id
            "#,
        )
        .bind(email)
        .bind(token)
        .bind(now)
        .bind(hash.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("apply password reset")?;

        if updated.is_none() {
            sqlx::query(
                r#"
                UPDATE users
                   SET reset_password_token = NULL,
                       reset_password_token_expiry = NULL
                 WHERE lower(email) = lower($1)
                   AND reset_password_token_expiry <= $2
                "#,
            )
            .bind(email)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("clear expired reset token")?;
        }

        tx.commit().await.context("commit tx")?;
        Ok(updated.is_some())
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET first_name = COALESCE($2, first_name),
                   last_name = COALESCE($3, last_name),
                   phone_number = COALESCE($4, phone_number)
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.first_name)
        .bind(update.last_name)
        .bind(update.phone_number)
        .fetch_optional(&self.db)
        .await
        .context("update profile")?;
        into_user(row)
    }

    async fn update_user(&self, id: Uuid, update: UserUpdate) -> anyhow::Result<UpdateOutcome> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let privileged = if update.role.is_some() {
            Self::lock_privileged(&mut tx).await?
        } else {
            Vec::new()
        };

        let Some(current) = Self::lock_role(&mut tx, id).await? else {
            return Ok(UpdateOutcome::NotFound);
        };

        if let Some(next) = update.role {
            if current.is_privileged() && !next.is_privileged() && privileged.len() <= 1 {
                return Ok(UpdateOutcome::LastAdmin);
            }
        }

        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET first_name = COALESCE($2, first_name),
                   last_name = COALESCE($3, last_name),
                   phone_number = COALESCE($4, phone_number),
                   role = COALESCE($5, role),
                   prescription_access = COALESCE($6, prescription_access)
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.profile.first_name)
        .bind(update.profile.last_name)
        .bind(update.profile.phone_number)
        .bind(update.role.map(|r| r.as_str()))
        .bind(update.prescription_access)
        .fetch_one(&mut *tx)
        .await
        .context("update user")?;

        tx.commit().await.context("commit tx")?;
        Ok(UpdateOutcome::Updated(User::try_from(row)?))
    }

    async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
              FROM users
             ORDER BY created_at DESC
             LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await
        .context("list users")?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn delete_user(&self, id: Uuid) -> anyhow::Result<DeleteOutcome> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let privileged = Self::lock_privileged(&mut tx).await?;
        let Some(role) = Self::lock_role(&mut tx, id).await? else {
            return Ok(DeleteOutcome::NotFound);
        };

        if role.is_privileged() && privileged.len() <= 1 {
            return Ok(DeleteOutcome::LastAdmin);
        }

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("delete user")?;

        tx.commit().await.context("commit tx")?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn store_refresh_token(
        &self,
        jti: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        // spent and expired tokens of this user are never looked at again
        sqlx::query(
            r#"
            DELETE FROM refresh_tokens
             WHERE user_id = $1
               AND (revoked_at IS NOT NULL OR expires_at <= now())
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .context("prune refresh tokens")?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (jti, user_id, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(jti)
        .bind(user_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .context("store refresh token")?;

        tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn consume_refresh_token(
        &self,
        jti: Uuid,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<Uuid>> {
        let owner = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE refresh_tokens
               SET revoked_at = $2
             WHERE jti = $1
               AND revoked_at IS NULL
               AND expires_at > $2
            RETURNING user_id
            "#,
        )
        .bind(jti)
        .bind(now)
        .fetch_optional(&self.db)
        .await
        .context("consume refresh token")?;
        Ok(owner)
    }

    async fn revoke_refresh_tokens(&self, user_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE refresh_tokens
               SET revoked_at = now()
             WHERE user_id = $1
               AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .execute(&self.db)
        .await
        .context("revoke refresh tokens")?;
        Ok(())
    }
}
