//! Storage seams for the token lifecycle.
//!
//! Each trait is implemented by an in-memory store (tests, local runs) and
//! by a networked backend: Redis for revocations, PostgreSQL for users and
//! refresh records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::db::models::{NewUser, RefreshRecord, User};
use crate::error::StorageError;

pub mod memory;
pub mod redis_store;

pub use memory::{MemoryRefreshStore, MemoryRevocationStore, MemoryUserStore};
pub use redis_store::RedisRevocationStore;

/// Blacklist of access-token identifiers. Entries vanish on their own once
/// the TTL passes.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn set(&self, id: &str, ttl: Duration) -> Result<(), StorageError>;
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Fails with `Duplicate` when the token is already stored.
    async fn insert(&self, record: &RefreshRecord) -> Result<(), StorageError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError>;

    /// Flips `revoked` from false to true. Returns whether this call did the flip.
    async fn compare_and_revoke(&self, token: &str) -> Result<bool, StorageError>;

    /// Revokes `old_token` and stores `replacement` as one conditional write.
    /// Returns false, storing nothing, when `old_token` was already revoked
    /// or is unknown.
    async fn rotate(&self, old_token: &str, replacement: &RefreshRecord) -> Result<bool, StorageError>;

    /// Deletes records that expired before `before`. Returns how many went.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Matches `login` against both username and email.
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>, StorageError>;

    async fn create_user(&self, user: NewUser) -> Result<User, StorageError>;
}

/// The store handles a session manager works against.
#[derive(Clone)]
pub struct Stores {
    pub revocations: Arc<dyn RevocationStore>,
    pub refresh_tokens: Arc<dyn RefreshStore>,
    pub users: Arc<dyn UserStore>,
}

/// Runs a store call with an upper bound on how long it may take.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Store call timed out");
            Err(StorageError::Timeout)
        }
    }
}
