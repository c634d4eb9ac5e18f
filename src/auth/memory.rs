//! In-process `UserStore` used by the test suites.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    password::HashedPassword,
    repo::UserStore,
    repo_types::{DeleteOutcome, NewUser, ProfileUpdate, UpdateOutcome, User, UserUpdate},
};

struct RefreshRecord {
    user_id: Uuid,
    expires_at: OffsetDateTime,
    revoked: bool,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    refresh: HashMap<Uuid, RefreshRecord>,
}

impl Inner {
    fn by_email_mut(&mut self, email: &str) -> Option<&mut User> {
        let email = email.to_lowercase();
        self.users
            .values_mut()
            .find(|u| u.email.to_lowercase() == email)
    }

    fn privileged_count(&self) -> usize {
        self.users.values().filter(|u| u.role.is_privileged()).count()
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<Inner>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    /// Refresh token rows kept for one user, live or not.
    pub async fn refresh_rows(&self, user_id: Uuid) -> usize {
        self.inner
            .lock()
            .await
            .refresh
            .values()
            .filter(|r| r.user_id == user_id)
            .count()
    }
}

fn apply_profile(user: &mut User, update: ProfileUpdate) {
    if let Some(v) = update.first_name {
        user.first_name = v;
    }
    if let Some(v) = update.last_name {
        user.last_name = v;
    }
    if let Some(v) = update.phone_number {
        user.phone_number = Some(v);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self.inner.lock().await.by_email_mut(email).map(|u| u.clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn create(&self, new: NewUser) -> anyhow::Result<Option<User>> {
        let mut inner = self.inner.lock().await;
        if inner.by_email_mut(&new.email).is_some() {
            return Ok(None);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            first_name: new.first_name,
            last_name: new.last_name,
            phone_number: new.phone_number,
            role: new.role,
            prescription_access: new.prescription_access,
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
            reset_password_token: None,
            reset_password_token_expiry: None,
        };
        inner.users.insert(user.id, user.clone());
        Ok(Some(user))
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        if let Some(u) = self.inner.lock().await.users.get_mut(&id) {
            u.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn set_password(&self, id: Uuid, hash: &HashedPassword) -> anyhow::Result<()> {
        if let Some(u) = self.inner.lock().await.users.get_mut(&id) {
            u.password_hash = hash.clone();
        }
        Ok(())
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> anyhow::Result<()> {
        if let Some(u) = self.inner.lock().await.users.get_mut(&id) {
            u.reset_password_token = Some(token.to_string());
            u.reset_password_token_expiry = Some(expiry);
        }
        Ok(())
    }

    async fn complete_password_reset(
        &self,
        email: &str,
        token: &str,
        now: OffsetDateTime,
        hash: &HashedPassword,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.by_email_mut(email) else {
            return Ok(false);
        };
        let live = user.reset_password_token_expiry.is_some_and(|e| e > now);
        let matches = user.reset_password_token.as_deref() == Some(token);
        if live && matches {
            user.password_hash = hash.clone();
        }
        if (live && matches) || !live {
            user.reset_password_token = None;
            user.reset_password_token_expiry = None;
        }
        Ok(live && matches)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> anyhow::Result<Option<User>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.users.get_mut(&id).map(|u| {
            apply_profile(u, update);
            u.clone()
        }))
    }

    async fn update_user(&self, id: Uuid, update: UserUpdate) -> anyhow::Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let privileged = inner.privileged_count();
        let Some(user) = inner.users.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if let Some(next) = update.role {
            if user.role.is_privileged() && !next.is_privileged() && privileged <= 1 {
                return Ok(UpdateOutcome::LastAdmin);
            }
            user.role = next;
        }
        if let Some(flag) = update.prescription_access {
            user.prescription_access = flag;
        }
        apply_profile(user, update.profile);
        Ok(UpdateOutcome::Updated(user.clone()))
    }

    async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>> {
        let inner = self.inner.lock().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_user(&self, id: Uuid) -> anyhow::Result<DeleteOutcome> {
        let mut inner = self.inner.lock().await;
        let privileged = inner.privileged_count();
        let Some(user) = inner.users.get(&id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if user.role.is_privileged() && privileged <= 1 {
            return Ok(DeleteOutcome::LastAdmin);
        }
        inner.users.remove(&id);
        inner.refresh.retain(|_, r| r.user_id != id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn store_refresh_token(
        &self,
        jti: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;
        inner
            .refresh
            .retain(|_, r| r.user_id != user_id || (!r.revoked && r.expires_at > now));
        inner.refresh.insert(
            jti,
            RefreshRecord {
                user_id,
                expires_at,
                revoked: false,
            },
        );
        Ok(())
    }

    async fn consume_refresh_token(
        &self,
        jti: Uuid,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        match inner.refresh.get_mut(&jti) {
            Some(r) if !r.revoked && r.expires_at > now => {
                r.revoked = true;
                Ok(Some(r.user_id))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_refresh_tokens(&self, user_id: Uuid) -> anyhow::Result<()> {
        for r in self.inner.lock().await.refresh.values_mut() {
            if r.user_id == user_id {
                r.revoked = true;
            }
        }
        Ok(())
    }
}
