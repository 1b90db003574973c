use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use super::{Clock, KeyStore};
use crate::db::models::RefreshRecord;
use crate::error::AuthError;
use crate::store::{bounded, RefreshStore};

/// Bytes of OS randomness behind each refresh token.
const REFRESH_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub store_timeout: std::time::Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::hours(24),
            store_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// Payload of an access token. `iat`/`exp` are Unix seconds; an `exp` of
/// zero means the issuer has not stamped the validity window yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    pub fn new<I, S>(subject: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sub: subject.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            iat: 0,
            exp: 0,
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_window(mut self, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        self.iat = issued_at.timestamp();
        self.exp = expires_at.timestamp();
        self
    }

    pub fn is_stamped(&self) -> bool {
        self.exp != 0
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.iat, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.exp, 0)
    }
}

/// Access and refresh token handed to a client together.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(access_token: String, claims: &Claims, refresh: &RefreshRecord) -> Self {
        Self {
            access_token,
            refresh_token: refresh.token.clone(),
            access_expires_at: claims.expires_at().unwrap_or_default(),
            refresh_expires_at: refresh.expires_at,
        }
    }
}

/// Stable identifier of an access token: hex SHA-256 of the full string.
/// Works for tokens that fail to parse, too.
pub fn token_id(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn short_id(token: &str) -> String {
    token_id(token)[..12].to_string()
}

pub struct TokenIssuer {
    keys: Arc<KeyStore>,
    refresh_tokens: Arc<dyn RefreshStore>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl TokenIssuer {
    pub fn new(
        keys: Arc<KeyStore>,
        refresh_tokens: Arc<dyn RefreshStore>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            keys,
            refresh_tokens,
            clock,
            config,
        }
    }

    /// Signs `claims`, stamping the validity window first when the caller
    /// left it unset. Returns the token and the claims it carries.
    pub fn issue_access_token(&self, claims: Claims) -> Result<(String, Claims), AuthError> {
        let claims = if claims.is_stamped() {
            claims
        } else {
            let now = self.clock.now();
            claims.with_window(now, now + self.config.access_ttl)
        };

        let token = self.keys.encode(&claims)?;
        debug!(subject = %claims.sub, exp = claims.exp, "Issued access token");
        Ok((token, claims))
    }

    /// Builds a fresh refresh record for the claims' subject and scopes
    /// without persisting it.
    pub fn mint_refresh_record(&self, claims: &Claims) -> Result<RefreshRecord, AuthError> {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            error!("OS random source failed: {}", e);
            AuthError::Signing
        })?;

        let now = self.clock.now();
        Ok(RefreshRecord {
            token: URL_SAFE_NO_PAD.encode(bytes),
            subject: claims.sub.clone(),
            scopes: claims.scopes.iter().cloned().collect(),
            issued_at: now,
            expires_at: now + self.config.refresh_ttl,
            revoked: false,
        })
    }

    /// Mints and persists a refresh record. Nothing is returned unless the
    /// record is durably stored.
    pub async fn issue_refresh_token(&self, claims: &Claims) -> Result<RefreshRecord, AuthError> {
        let record = self.mint_refresh_record(claims)?;
        bounded(
            self.config.store_timeout,
            "insert_refresh_token",
            self.refresh_tokens.insert(&record),
        )
        .await?;

        debug!(subject = %record.subject, token = %short_id(&record.token), "Issued refresh token");
        Ok(record)
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }
}
