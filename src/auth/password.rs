use std::fmt;

use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::{error, warn};

use crate::config::PasswordConfig;

/// An argon2 PHC string. Only [`Hasher::hash`] and the user store create
/// these, so a raw password can never be persisted by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct HashedPassword(String);

impl HashedPassword {
    /// Wraps a value read back from storage.
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashedPassword(..)")
    }
}

#[derive(Clone)]
pub struct Hasher {
    argon2: Argon2<'static>,
    dummy: HashedPassword,
}

impl Hasher {
    pub fn new(cfg: &PasswordConfig) -> anyhow::Result<Self> {
        let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 params: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut hasher = Self {
            argon2,
            dummy: HashedPassword(String::new()),
        };
        hasher.dummy = hasher.hash_blocking(&uuid::Uuid::new_v4().to_string())?;
        Ok(hasher)
    }

    pub fn hash_blocking(&self, plain: &str) -> anyhow::Result<HashedPassword> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(HashedPassword(hash))
    }

    /// Malformed stored hashes count as a mismatch.
    pub fn verify_blocking(&self, plain: &str, hash: &HashedPassword) -> bool {
        let parsed = match PasswordHash::new(hash.as_str()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "stored password hash is malformed");
                return false;
            }
        };
        self.argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok()
    }

    pub async fn hash(&self, plain: &str) -> anyhow::Result<HashedPassword> {
        let this = self.clone();
        let plain = plain.to_owned();
        tokio::task::spawn_blocking(move || this.hash_blocking(&plain))
            .await
            .context("hash task panicked")?
    }

    pub async fn verify(&self, plain: &str, hash: &HashedPassword) -> anyhow::Result<bool> {
        let this = self.clone();
        let plain = plain.to_owned();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || this.verify_blocking(&plain, &hash))
            .await
            .context("verify task panicked")
    }

    /// Burns one verification against a throwaway hash so an unknown account
    /// costs the same as a wrong password.
    pub async fn verify_dummy(&self, plain: &str) -> anyhow::Result<()> {
        let dummy = self.dummy.clone();
        self.verify(plain, &dummy).await.map(|_| ())
    }
}
