use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub scopes: Vec<String>,
}

impl User {
    pub fn new(new_user: NewUser) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: new_user.username,
            email: new_user.email,
            password_hash: new_user.password_hash,
            scopes: new_user.scopes,
            created_at: Utc::now(),
        }
    }
}

/// Server-side state of one refresh token. `revoked` only ever goes from
/// false to true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub token: String,
    pub subject: String,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Marker that keeps a revoked access token rejected until it would have
/// expired anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub token_id: String,
    pub blacklisted_until: DateTime<Utc>,
}

impl BlacklistEntry {
    /// Entry covering a token that expires at `expires_at`. The extra second
    /// keeps the entry alive through the token's final valid second.
    pub fn covering(token_id: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            token_id,
            blacklisted_until: expires_at + Duration::seconds(1),
        }
    }

    /// Whole-second TTL from `now`, rounded up. `None` once the entry is moot.
    pub fn ttl_from(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let remaining = (self.blacklisted_until - now).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        let mut secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs += 1;
        }
        Some(std::time::Duration::from_secs(secs))
    }
}
