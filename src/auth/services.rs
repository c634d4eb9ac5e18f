use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use regex::Regex;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    claims::Claims,
    dto::{
        AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest,
        MessageResponse, Pagination, RegisterRequest, ResetPasswordRequest,
        UpdateProfileRequest, UpdateUserRequest, UserDetails, UserSummary,
    },
    repo_types::{DeleteOutcome, NewUser, ProfileUpdate, UpdateOutcome, User, UserUpdate},
    roles::Role,
};
use crate::{
    error::{AppError, AppResult, Validator},
    mail,
    state::AppState,
};

pub const INVALID_CREDENTIALS: &str = "Invalid email or password";
pub const FORGOT_PASSWORD_MESSAGE: &str =
    "If an account with that email exists, a password reset link has been sent";
pub const INVALID_RESET_TOKEN: &str = "Invalid or expired reset token";
pub const INVALID_REFRESH_TOKEN: &str = "Invalid refresh token";
pub const LAST_ADMIN_DELETE: &str = "Cannot delete the last admin user";
pub const LAST_ADMIN_DEMOTE: &str = "Cannot demote the last admin user";

const MIN_PASSWORD_LEN: usize = 8;
const RESET_TOKEN_LEN: usize = 48;
const MAX_PAGE: i64 = 100;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn new_reset_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(RESET_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn check_new_password(
    v: &mut Validator,
    field: &str,
    new: &str,
    confirm: &str,
    confirm_field: &str,
) {
    v.check(
        new.chars().count() >= MIN_PASSWORD_LEN,
        field,
        "Password must be at least 8 characters",
    )
    .check(new == confirm, confirm_field, "Passwords do not match");
}

fn holds_reset_token(user: Option<&User>, token: &str) -> bool {
    user.and_then(|u| u.reset_password_token.as_deref()) == Some(token)
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string())
}

/// Signs an access/refresh pair and records the refresh `jti`.
async fn issue_session(
    st: &AppState,
    user: &User,
    remember_me: bool,
    message: &str,
) -> AppResult<AuthResponse> {
    let access = st.keys.sign_access(user)?;
    let refresh = st.keys.sign_refresh(user, remember_me)?;
    st.store
        .store_refresh_token(refresh.jti, user.id, refresh.expires_at)
        .await?;
    Ok(AuthResponse {
        success: true,
        message: message.to_string(),
        token: access.token,
        refresh_token: refresh.token,
        expiration: access.expires_at,
        user: UserSummary::from(user),
    })
}

pub async fn login(st: &AppState, req: LoginRequest) -> AppResult<AuthResponse> {
    let email = normalize_email(&req.email);
    Validator::new()
        .check(!email.is_empty(), "email", "Email is required")
        .check(!req.password.is_empty(), "password", "Password is required")
        .finish()?;

    let Some(mut user) = st.store.find_by_email(&email).await? else {
        st.hasher.verify_dummy(&req.password).await?;
        warn!(email = %email, "login unknown email");
        return Err(AppError::unauthorized(INVALID_CREDENTIALS));
    };

    if !st.hasher.verify(&req.password, &user.password_hash).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::unauthorized(INVALID_CREDENTIALS));
    }

    let now = OffsetDateTime::now_utc();
    st.store.record_login(user.id, now).await?;
    user.last_login_at = Some(now);

    info!(user_id = %user.id, "user logged in");
    issue_session(st, &user, req.remember_me, "Login successful").await
}

pub async fn register(st: &AppState, req: RegisterRequest) -> AppResult<AuthResponse> {
    let email = normalize_email(&req.email);
    let first_name = req.first_name.trim().to_string();
    let last_name = req.last_name.trim().to_string();

    let mut v = Validator::new();
    v.check(is_valid_email(&email), "email", "Invalid email")
        .check(!first_name.is_empty(), "firstName", "First name is required")
        .check(!last_name.is_empty(), "lastName", "Last name is required");
    check_new_password(
        &mut v,
        "password",
        &req.password,
        &req.confirm_password,
        "confirmPassword",
    );
    v.finish()?;

    if st.store.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::conflict("Email is already registered"));
    }

    let password_hash = st.hasher.hash(&req.password).await?;
    let created = st
        .store
        .create(NewUser {
            email: email.clone(),
            password_hash,
            first_name,
            last_name,
            phone_number: clean(req.phone_number).filter(|p| !p.is_empty()),
            role: Role::Customer,
            prescription_access: false,
        })
        .await?;

    let Some(user) = created else {
        // lost a race with a concurrent registration
        warn!(email = %email, "email already registered");
        return Err(AppError::conflict("Email is already registered"));
    };

    info!(user_id = %user.id, "user registered");
    issue_session(st, &user, false, "Registration successful").await
}

/// Always answers with the same message; failures are only logged.
pub async fn forgot_password(st: &AppState, req: ForgotPasswordRequest) -> MessageResponse {
    let email = normalize_email(&req.email);
    if is_valid_email(&email) {
        if let Err(e) = start_password_reset(st, &email).await {
            error!(error = ?e, "forgot password failed");
        }
    }
    MessageResponse::new(FORGOT_PASSWORD_MESSAGE)
}

async fn start_password_reset(st: &AppState, email: &str) -> anyhow::Result<()> {
    let Some(user) = st.store.find_by_email(email).await? else {
        info!("password reset requested for unknown email");
        return Ok(());
    };

    let token = new_reset_token();
    let expiry = OffsetDateTime::now_utc() + TimeDuration::minutes(st.config.reset.ttl_minutes);
    st.store.set_reset_token(user.id, &token, expiry).await?;

    let link = mail::reset_link(&st.config.reset.url_base, &token, &user.email);
    if let Err(e) = st.mailer.send_password_reset(&user.email, &link).await {
        warn!(error = %e, user_id = %user.id, "reset email failed");
    }
    info!(user_id = %user.id, "password reset token issued");
    Ok(())
}

pub async fn reset_password(
    st: &AppState,
    req: ResetPasswordRequest,
) -> AppResult<MessageResponse> {
    let email = normalize_email(&req.email);
    let mut v = Validator::new();
    v.check(!req.token.trim().is_empty(), "token", "Token is required")
        .check(!email.is_empty(), "email", "Email is required");
    check_new_password(
        &mut v,
        "newPassword",
        &req.new_password,
        &req.confirm_new_password,
        "confirmNewPassword",
    );
    v.finish()?;

    // reject unknown tokens before hashing; expiry and single use are
    // enforced by the store, which also clears an expired token
    let token = req.token.trim();
    let holder = st.store.find_by_email(&email).await?;
    if !holds_reset_token(holder.as_ref(), token) {
        warn!("password reset rejected");
        return Err(AppError::validation(INVALID_RESET_TOKEN));
    }

    let hash = st.hasher.hash(&req.new_password).await?;
    let now = OffsetDateTime::now_utc();
    if !st
        .store
        .complete_password_reset(&email, token, now, &hash)
        .await?
    {
        warn!("password reset rejected");
        return Err(AppError::validation(INVALID_RESET_TOKEN));
    }

    if let Some(user) = st.store.find_by_email(&email).await? {
        st.store.revoke_refresh_tokens(user.id).await?;
        info!(user_id = %user.id, "password reset completed");
    }
    Ok(MessageResponse::new("Password has been reset successfully"))
}

pub async fn change_password(
    st: &AppState,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> AppResult<MessageResponse> {
    let user = st
        .store
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    if !st.hasher.verify(&req.current_password, &user.password_hash).await? {
        warn!(user_id = %user.id, "change password: current password mismatch");
        return Err(AppError::with_fields(
            "Current password is incorrect",
            [("currentPassword".to_string(), vec!["Current password is incorrect".to_string()])]
                .into_iter()
                .collect(),
        ));
    }

    let mut v = Validator::new();
    check_new_password(
        &mut v,
        "newPassword",
        &req.new_password,
        &req.confirm_new_password,
        "confirmNewPassword",
    );
    v.finish()?;

    let hash = st.hasher.hash(&req.new_password).await?;
    st.store.set_password(user.id, &hash).await?;
    st.store.revoke_refresh_tokens(user.id).await?;

    info!(user_id = %user.id, "password changed");
    Ok(MessageResponse::new("Password changed successfully"))
}

/// Exchanges a live refresh token for a new pair. The old one is spent.
pub async fn refresh_token(st: &AppState, token: &str) -> AppResult<AuthResponse> {
    let invalid = || AppError::validation(INVALID_REFRESH_TOKEN);

    let claims = st.keys.verify_refresh(token.trim()).ok_or_else(invalid)?;
    let owner = st
        .store
        .consume_refresh_token(claims.jti, OffsetDateTime::now_utc())
        .await?;
    if owner != Some(claims.sub) {
        warn!(user_id = %claims.sub, jti = %claims.jti, "refresh token reused or revoked");
        return Err(invalid());
    }

    let user = st.store.find_by_id(claims.sub).await?.ok_or_else(invalid)?;
    let remember_me = claims.exp - claims.iat > st.keys.refresh_ttl.as_secs() as i64;
    issue_session(st, &user, remember_me, "Token refreshed").await
}

pub async fn get_user_details(st: &AppState, user_id: Uuid) -> AppResult<UserDetails> {
    st.store
        .find_by_id(user_id)
        .await?
        .map(UserDetails::from)
        .ok_or_else(|| AppError::not_found("User not found"))
}

fn profile_update(
    first_name: Option<String>,
    last_name: Option<String>,
    phone_number: Option<String>,
) -> AppResult<ProfileUpdate> {
    let update = ProfileUpdate {
        first_name: clean(first_name),
        last_name: clean(last_name),
        phone_number: clean(phone_number),
    };
    Validator::new()
        .check(
            update.first_name.as_deref() != Some(""),
            "firstName",
            "First name cannot be empty",
        )
        .check(
            update.last_name.as_deref() != Some(""),
            "lastName",
            "Last name cannot be empty",
        )
        .finish()?;
    Ok(update)
}

pub async fn update_user_details(
    st: &AppState,
    user_id: Uuid,
    req: UpdateProfileRequest,
) -> AppResult<UserDetails> {
    let update = profile_update(req.first_name, req.last_name, req.phone_number)?;
    let user = st
        .store
        .update_profile(user_id, update)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    info!(user_id = %user.id, "profile updated");
    Ok(UserDetails::from(user))
}

pub async fn list_users(st: &AppState, page: Pagination) -> AppResult<Vec<UserDetails>> {
    let limit = page.limit.clamp(1, MAX_PAGE);
    let offset = page.offset.max(0);
    let users = st.store.list(limit, offset).await?;
    Ok(users.into_iter().map(UserDetails::from).collect())
}

/// Admin edit. Only a superadmin may move users into or out of superadmin.
pub async fn update_user(
    st: &AppState,
    actor: &Claims,
    id: Uuid,
    req: UpdateUserRequest,
) -> AppResult<UserDetails> {
    let profile = profile_update(req.first_name, req.last_name, req.phone_number)?;

    if let Some(next) = req.role {
        let target = st
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;
        if !actor.role.can_assign(next) || !actor.role.can_assign(target.role) {
            warn!(actor = %actor.sub, target = %id, role = %next, "role change refused");
            return Err(AppError::forbidden("Insufficient role to assign this role"));
        }
    }

    let update = UserUpdate {
        profile,
        role: req.role,
        prescription_access: req.prescription_access,
    };
    match st.store.update_user(id, update).await? {
        UpdateOutcome::Updated(user) => {
            info!(actor = %actor.sub, target = %user.id, role = %user.role, "user updated");
            Ok(UserDetails::from(user))
        }
        UpdateOutcome::NotFound => Err(AppError::not_found("User not found")),
        UpdateOutcome::LastAdmin => {
            warn!(actor = %actor.sub, target = %id, "refused to demote last admin");
            Err(AppError::validation(LAST_ADMIN_DEMOTE))
        }
    }
}

pub async fn delete_user(st: &AppState, actor: &Claims, id: Uuid) -> AppResult<MessageResponse> {
    let target = st
        .store
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    if !actor.role.can_assign(target.role) {
        return Err(AppError::forbidden("Insufficient role to delete this user"));
    }

    match st.store.delete_user(id).await? {
        DeleteOutcome::Deleted => {
            info!(actor = %actor.sub, target = %id, "user deleted");
            Ok(MessageResponse::new("User deleted successfully"))
        }
        DeleteOutcome::NotFound => Err(AppError::not_found("User not found")),
        DeleteOutcome::LastAdmin => {
            warn!(actor = %actor.sub, target = %id, "refused to delete last admin");
            Err(AppError::validation(LAST_ADMIN_DELETE))
        }
    }
}

/// Creates the configured superadmin on first start.
pub async fn ensure_bootstrap_admin(st: &AppState) -> anyhow::Result<()> {
    let Some(admin) = st.config.bootstrap_admin.as_ref() else {
        return Ok(());
    };
    let email = normalize_email(&admin.email);
    anyhow::ensure!(is_valid_email(&email), "ADMIN_EMAIL is not a valid email");
    if st.store.find_by_email(&email).await?.is_some() {
        return Ok(());
    }

    let password_hash = st.hasher.hash(&admin.password).await?;
    let created = st
        .store
        .create(NewUser {
            email,
            password_hash,
            first_name: "System".into(),
            last_name: "Administrator".into(),
            phone_number: None,
            role: Role::SuperAdmin,
            prescription_access: true,
        })
        .await?;
    if let Some(user) = created {
        info!(user_id = %user.id, "bootstrap superadmin created");
    }
    Ok(())
}
