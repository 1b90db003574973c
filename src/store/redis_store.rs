use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::time::Duration;
use tracing::{error, info};

use super::RevocationStore;
use crate::error::{AppError, StorageError};

/// Blacklist backed by Redis keys with native expiry.
#[derive(Clone)]
pub struct RedisRevocationStore {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisRevocationStore {
    /// Opens the multiplexed connection shared by every request.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis revocation store");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

/// Redis expiries are whole seconds, so round up and never go below one.
fn expiry_seconds(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.max(1)
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn set(&self, id: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(self.key(id), "1", expiry_seconds(ttl) as _)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write revocation marker");
                StorageError::Unavailable
            })
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        conn.exists::<_, bool>(self.key(id)).await.map_err(|e| {
            error!(error = %e, "Failed to read revocation marker");
            StorageError::Unavailable
        })
    }
}
