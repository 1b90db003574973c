pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod store;

use actix_web::{web, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{BcryptHasher, Clock, KeyStore, PasswordHasher, SessionManager, SystemClock};
pub use db::DbOperations;

use store::{MemoryRefreshStore, MemoryRevocationStore, MemoryUserStore, RedisRevocationStore, Stores, UserStore};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and, when backed by
/// PostgreSQL, the connection pool status
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let mut body = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(db) = &state.db {
        body["database"] = serde_json::json!(db.get_pool_status());
    }
    HttpResponse::Ok().json(body)
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub users: Arc<dyn UserStore>,
    pub passwords: Arc<dyn PasswordHasher>,
    pub db: Option<Arc<DbOperations>>,
}

impl AppState {
    /// Connects PostgreSQL and Redis and applies pending migrations.
    pub async fn new(config: Settings) -> Result<Self> {
        let db = Arc::new(
            DbOperations::new_with_options(
                &config.database.url,
                config.database.max_connections,
                Duration::from_secs(config.database.acquire_timeout_secs),
            )
            .await?,
        );
        db.run_migrations().await?;

        let revocations = RedisRevocationStore::connect(&config.redis.url, config.redis.key_prefix.clone()).await?;
        info!("Connected to PostgreSQL and Redis");

        let stores = Stores {
            revocations: Arc::new(revocations),
            refresh_tokens: db.clone(),
            users: db.clone(),
        };
        let passwords: Arc<dyn PasswordHasher> = Arc::new(BcryptHasher::new(config.auth.bcrypt_cost));

        Self::assemble(config, stores, passwords, Arc::new(SystemClock), Some(db))
    }

    /// State backed entirely by in-process stores.
    pub fn in_memory(
        config: Settings,
        clock: Arc<dyn Clock>,
        passwords: Arc<dyn PasswordHasher>,
    ) -> Result<Self> {
        let stores = Stores {
            revocations: Arc::new(MemoryRevocationStore::new(clock.clone())),
            refresh_tokens: Arc::new(MemoryRefreshStore::new()),
            users: Arc::new(MemoryUserStore::new()),
        };
        Self::assemble(config, stores, passwords, clock, None)
    }

    fn assemble(
        config: Settings,
        stores: Stores,
        passwords: Arc<dyn PasswordHasher>,
        clock: Arc<dyn Clock>,
        db: Option<Arc<DbOperations>>,
    ) -> Result<Self> {
        let keys = Arc::new(KeyStore::from_secret(&config.auth.jwt_secret)?);
        let users = stores.users.clone();
        let sessions = SessionManager::new(
            keys,
            stores,
            passwords.clone(),
            clock,
            config.auth.token_config(),
        );

        Ok(Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            users,
            passwords,
            db,
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.pool().close().await;
            info!("Database pool closed");
        }
        Ok(())
    }
}
