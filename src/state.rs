use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::auth::{jwt::JwtKeys, password::Hasher, repo::PgUserStore, repo::UserStore};
use crate::config::AppConfig;
use crate::mail::{LogMailer, Mailer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn UserStore>,
    pub keys: JwtKeys,
    pub hasher: Hasher,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    /// Connects to Postgres, applies migrations and wires the production collaborators.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("run migrations")?;

        Self::from_parts(
            Arc::new(config),
            Arc::new(PgUserStore::new(db)),
            Arc::new(LogMailer),
        )
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
    ) -> anyhow::Result<Self> {
        let keys = JwtKeys::new(&config.jwt).context("build jwt keys")?;
        let hasher = Hasher::new(&config.password).context("build password hasher")?;
        Ok(Self {
            config,
            store,
            keys,
            hasher,
            mailer,
        })
    }

    /// State backed by the in-memory store and a recording mailer.
    #[cfg(test)]
    pub fn fake() -> (
        Self,
        Arc<crate::auth::memory::MemoryUserStore>,
        Arc<crate::mail::testing::RecordingMailer>,
    ) {
        let store = Arc::new(crate::auth::memory::MemoryUserStore::new());
        let mailer = Arc::new(crate::mail::testing::RecordingMailer::default());
        let state = Self::from_parts(
            Arc::new(AppConfig::for_tests()),
            store.clone(),
            mailer.clone(),
        )
        .expect("test state");
        (state, store, mailer)
    }
}
