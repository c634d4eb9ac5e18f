use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::{
    claims::{Claims, TokenKind},
    repo_types::User,
};
use crate::{config::JwtConfig, state::AppState};

/// A signed token plus the bits of its payload callers need to persist or echo.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: Uuid,
    pub expires_at: OffsetDateTime,
}

/// Signing and verification keys with issuer/audience and lifetimes.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub remember_me_ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.keys.clone()
    }
}

fn minutes(m: i64) -> Duration {
    Duration::from_secs(m.max(0) as u64 * 60)
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!cfg.secret.trim().is_empty(), "jwt secret must not be empty");
        Ok(Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: minutes(cfg.ttl_minutes),
            refresh_ttl: minutes(cfg.refresh_ttl_minutes),
            remember_me_ttl: minutes(cfg.remember_me_ttl_minutes),
        })
    }

    fn sign_at(
        &self,
        user: &User,
        kind: TokenKind,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> anyhow::Result<IssuedToken> {
        anyhow::ensure!(!user.email.is_empty(), "cannot sign a token for a user without email");
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        let jti = Uuid::new_v4();
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            jti,
            name: user.display_name(),
            role: user.role,
            prescription_access: user.prescription_access.then_some(true),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        debug!(user_id = %user.id, kind = ?kind, %jti, "jwt signed");
        Ok(IssuedToken {
            token,
            jti,
            expires_at: exp,
        })
    }

    pub fn sign_access_at(&self, user: &User, now: OffsetDateTime) -> anyhow::Result<IssuedToken> {
        self.sign_at(user, TokenKind::Access, self.access_ttl, now)
    }

    pub fn sign_access(&self, user: &User) -> anyhow::Result<IssuedToken> {
        self.sign_access_at(user, OffsetDateTime::now_utc())
    }

    pub fn sign_refresh(&self, user: &User, remember_me: bool) -> anyhow::Result<IssuedToken> {
        let ttl = if remember_me {
            self.remember_me_ttl
        } else {
            self.refresh_ttl
        };
        self.sign_at(user, TokenKind::Refresh, ttl, OffsetDateTime::now_utc())
    }

    /// Checks issuer, audience, signature and `now < exp`. Every failure
    /// collapses to `None`.
    pub fn verify_at(&self, token: &str, now: OffsetDateTime) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        // expiry is checked below against the supplied clock, without leeway
        validation.validate_exp = false;

        let claims = match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(error = %e, "jwt rejected");
                return None;
            }
        };
        if now.unix_timestamp() >= claims.exp {
            debug!(user_id = %claims.sub, "jwt expired");
            return None;
        }
        Some(claims)
    }

    pub fn verify(&self, token: &str) -> Option<Claims> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_access(&self, token: &str) -> Option<Claims> {
        self.verify(token).filter(|c| c.kind == TokenKind::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> Option<Claims> {
        self.verify(token).filter(|c| c.kind == TokenKind::Refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{password::HashedPassword, roles::Role},
        config::AppConfig,
    };

    fn make_keys(secret: &str, issuer: &str, audience: &str) -> JwtKeys {
        let mut cfg = AppConfig::for_tests().jwt;
        cfg.secret = secret.into();
        cfg.issuer = issuer.into();
        cfg.audience = audience.into();
        JwtKeys::new(&cfg).expect("keys")
    }

    fn user(role: Role, prescription_access: bool) -> User {
        User {
            id: Uuid::new_v4(),
            email: "alice@x.com".into(),
            password_hash: HashedPassword::from_stored(String::new()),
            first_name: "Alice".into(),
            last_name: "Smith".into(),
            phone_number: None,
            role,
            prescription_access,
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
            reset_password_token: None,
            reset_password_token_expiry: None,
        }
    }

    #[test]
    fn sign_and_verify_access_token() {
        let keys = make_keys("dev-secret", "test-issuer", "test-aud");
        let u = user(Role::Pharmacist, false);
        let issued = keys.sign_access(&u).expect("sign access");
        let claims = keys.verify_access(&issued.token).expect("verify token");
        assert_eq!(claims.sub, u.id);
        assert_eq!(claims.email, "alice@x.com");
        assert_eq!(claims.name, "Alice Smith");
        assert_eq!(claims.role, Role::Pharmacist);
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.iss, "test-issuer");
        assert_eq!(claims.aud, "test-aud");
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.exp, issued.expires_at.unix_timestamp());
    }

    #[test]
    fn each_issuance_gets_fresh_jti() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let u = user(Role::Customer, false);
        let a = keys.sign_access(&u).unwrap();
        let b = keys.sign_access(&u).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn prescription_claim_only_present_when_true() {
        let keys = make_keys("dev-secret", "iss", "aud");

        let without = keys.sign_access(&user(Role::Customer, false)).unwrap();
        let claims = keys.verify(&without.token).unwrap();
        assert_eq!(claims.prescription_access, None);
        assert!(!claims.has_prescription_access());

        let with = keys.sign_access(&user(Role::Customer, true)).unwrap();
        let claims = keys.verify(&with.token).unwrap();
        assert_eq!(claims.prescription_access, Some(true));
    }

    #[test]
    fn expiry_boundary() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let issued_at = OffsetDateTime::now_utc();
        let issued = keys
            .sign_access_at(&user(Role::Customer, false), issued_at)
            .unwrap();
        let exp = issued.expires_at;

        assert!(keys.verify_at(&issued.token, issued_at).is_some());
        assert!(keys
            .verify_at(&issued.token, exp - TimeDuration::seconds(1))
            .is_some());
        assert!(keys.verify_at(&issued.token, exp).is_none());
        assert!(keys
            .verify_at(&issued.token, exp + TimeDuration::seconds(1))
            .is_none());
    }

    #[test]
    fn tampering_any_byte_invalidates() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let token = keys.sign_access(&user(Role::Admin, true)).unwrap().token;
        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            if bytes[i] == b'.' {
                continue;
            }
            let mut forged = bytes.to_vec();
            forged[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let forged = String::from_utf8(forged).unwrap();
            assert!(keys.verify(&forged).is_none(), "byte {i} flip accepted");
        }
    }

    #[test]
    fn verify_refresh_rejects_access_token() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let u = user(Role::Customer, false);
        let access = keys.sign_access(&u).unwrap();
        let refresh = keys.sign_refresh(&u, false).unwrap();
        assert!(keys.verify_refresh(&access.token).is_none());
        assert!(keys.verify_access(&refresh.token).is_none());
        assert_eq!(
            keys.verify_refresh(&refresh.token).unwrap().kind,
            TokenKind::Refresh
        );
    }

    #[test]
    fn remember_me_extends_refresh_lifetime() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let u = user(Role::Customer, false);
        let short = keys.sign_refresh(&u, false).unwrap();
        let long = keys.sign_refresh(&u, true).unwrap();
        assert!(long.expires_at > short.expires_at);
    }

    #[test]
    fn verify_rejects_wrong_issuer_audience_or_key() {
        let good = make_keys("same-secret", "good-iss", "good-aud");
        let token = good.sign_access(&user(Role::Customer, false)).unwrap().token;
        assert!(make_keys("same-secret", "bad-iss", "good-aud").verify(&token).is_none());
        assert!(make_keys("same-secret", "good-iss", "bad-aud").verify(&token).is_none());
        assert!(make_keys("other-secret", "good-iss", "good-aud").verify(&token).is_none());
        assert!(good.verify("not.a.jwt").is_none());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let mut cfg = AppConfig::for_tests().jwt;
        cfg.secret = "  ".into();
        assert!(JwtKeys::new(&cfg).is_err());
    }
}
