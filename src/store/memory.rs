use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{RefreshStore, RevocationStore, UserStore};
use crate::auth::Clock;
use crate::db::models::{NewUser, RefreshRecord, User};
use crate::error::StorageError;

/// Blacklist kept in process memory. Expiry follows the injected clock.
pub struct MemoryRevocationStore {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRevocationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// When the entry for `id` lapses, if it is still live.
    pub async fn blacklisted_until(&self, id: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(id)
            .copied()
            .filter(|until| *until > now)
    }

    pub async fn cleanup(&self) {
        let now = self.clock.now();
        self.entries.write().await.retain(|_, until| *until > now);
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn set(&self, id: &str, ttl: Duration) -> Result<(), StorageError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| StorageError::Unavailable)?;
        let until = self.clock.now() + ttl;

        let mut entries = self.entries.write().await;
        let slot = entries.entry(id.to_string()).or_insert(until);
        // Never shorten an existing entry
        if *slot < until {
            *slot = until;
        }
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.blacklisted_until(id).await.is_some())
    }
}

/// Refresh records kept in process memory. One mutex guards every write, so
/// the conditional updates are atomic.
#[derive(Default)]
pub struct MemoryRefreshStore {
    records: Mutex<HashMap<String, RefreshRecord>>,
}

impl MemoryRefreshStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl RefreshStore for MemoryRefreshStore {
    async fn insert(&self, record: &RefreshRecord) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.token) {
            return Err(StorageError::Duplicate);
        }
        records.insert(record.token.clone(), record.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError> {
        Ok(self.records.lock().await.get(token).cloned())
    }

    async fn compare_and_revoke(&self, token: &str) -> Result<bool, StorageError> {
        let mut records = self.records.lock().await;
        match records.get_mut(token) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate(&self, old_token: &str, replacement: &RefreshRecord) -> Result<bool, StorageError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&replacement.token) {
            return Err(StorageError::Duplicate);
        }
        match records.get_mut(old_token) {
            Some(record) if !record.revoked => {
                record.revoked = true;
            }
            _ => return Ok(false),
        }
        records.insert(replacement.token.clone(), replacement.clone());
        Ok(true)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut records = self.records.lock().await;
        let initial = records.len();
        records.retain(|_, record| record.expires_at >= before);
        let purged = (initial - records.len()) as u64;
        debug!(purged, "Purged expired refresh records");
        Ok(purged)
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>, StorageError> {
        let users = self.users.read().await;
        Ok(users
            .get(login)
            .or_else(|| users.values().find(|user| user.email == login))
            .cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        let mut users = self.users.write().await;
        let taken = users
            .values()
            .any(|existing| existing.username == user.username || existing.email == user.email);
        if taken {
            return Err(StorageError::Duplicate);
        }

        let user = User::new(user);
        users.insert(user.username.clone(), user.clone());
        Ok(user)
    }
}
