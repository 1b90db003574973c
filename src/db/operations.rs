use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::auth::token_id;
use crate::db::models::{NewUser, RefreshRecord, User};
use crate::error::{AppError, StorageError};
use crate::store::{RefreshStore, UserStore};

pub struct DbOperations {
    pool: Arc<PgPool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DbPoolStatus {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
}

/// Refresh rows hold the token's hash, never the token itself.
#[derive(Debug, FromRow)]
struct RefreshRow {
    subject: String,
    scopes: Vec<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

impl RefreshRow {
    fn into_record(self, token: &str) -> RefreshRecord {
        RefreshRecord {
            token: token.to_string(),
            subject: self.subject,
            scopes: self.scopes,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            revoked: self.revoked,
        }
    }
}

fn storage_error(operation: &'static str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            debug!(operation, "Unique constraint rejected write");
            StorageError::Duplicate
        }
        sqlx::Error::PoolTimedOut => {
            error!(operation, "Timed out acquiring a database connection");
            StorageError::Timeout
        }
        other => {
            error!(operation, error = %other, "Database operation failed");
            StorageError::Unavailable
        }
    }
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    pub async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn get_pool_status(&self) -> DbPoolStatus {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;

        DbPoolStatus {
            total_connections: size,
            active_connections: size.saturating_sub(idle),
            idle_connections: idle,
        }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>, StorageError> {
        self.pool
            .as_ref()
            .begin()
            .await
            .map_err(|e| storage_error("begin_transaction", e))
    }

    async fn insert_with_transaction(
        record: &RefreshRecord,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, subject, scopes, issued_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token_id(&record.token))
        .bind(&record.subject)
        .bind(&record.scopes)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .bind(record.revoked)
        .execute(&mut **transaction)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UserStore for DbOperations {
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>, StorageError> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, scopes, created_at FROM users WHERE username = $1 OR email = $1 LIMIT 1",
        )
        .bind(login)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| storage_error("find_user", e))
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        let user = User::new(user);
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, password_hash, scopes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, username, email, password_hash, scopes, created_at
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.scopes)
        .bind(user.created_at)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| storage_error("create_user", e))
    }
}

#[async_trait]
impl RefreshStore for DbOperations {
    async fn insert(&self, record: &RefreshRecord) -> Result<(), StorageError> {
        let mut transaction = self.begin_transaction().await?;

        match Self::insert_with_transaction(record, &mut transaction).await {
            Ok(()) => transaction
                .commit()
                .await
                .map_err(|e| storage_error("insert_refresh_token", e)),
            Err(e) => {
                let _ = transaction.rollback().await;
                Err(storage_error("insert_refresh_token", e))
            }
        }
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError> {
        let row = sqlx::query_as::<_, RefreshRow>(
            "SELECT subject, scopes, issued_at, expires_at, revoked FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_id(token))
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| storage_error("find_refresh_token", e))?;

        Ok(row.map(|row| row.into_record(token)))
    }

    async fn compare_and_revoke(&self, token: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE token_hash = $1 AND revoked = FALSE",
        )
        .bind(token_id(token))
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| storage_error("revoke_refresh_token", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn rotate(&self, old_token: &str, replacement: &RefreshRecord) -> Result<bool, StorageError> {
        let mut transaction = self.begin_transaction().await?;

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE token_hash = $1 AND revoked = FALSE",
        )
        .bind(token_id(old_token))
        .execute(&mut *transaction)
        .await
        .map_err(|e| storage_error("rotate_refresh_token", e))?;

        if revoked.rows_affected() != 1 {
            let _ = transaction.rollback().await;
            return Ok(false);
        }

        if let Err(e) = Self::insert_with_transaction(replacement, &mut transaction).await {
            let _ = transaction.rollback().await;
            return Err(storage_error("rotate_refresh_token", e));
        }

        transaction
            .commit()
            .await
            .map_err(|e| storage_error("rotate_refresh_token", e))?;
        Ok(true)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(before)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| storage_error("purge_refresh_tokens", e))?;

        Ok(result.rows_affected())
    }
}
