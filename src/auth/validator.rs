use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use super::token::{short_id, token_id, Claims, TokenConfig};
use super::{Clock, KeyStore};
use crate::db::models::RefreshRecord;
use crate::error::AuthError;
use crate::store::{bounded, RefreshStore, RevocationStore};

/// Read-only checks on presented tokens. Never writes to a store, so every
/// call can be retried safely.
pub struct TokenValidator {
    keys: Arc<KeyStore>,
    revocations: Arc<dyn RevocationStore>,
    refresh_tokens: Arc<dyn RefreshStore>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl TokenValidator {
    pub fn new(
        keys: Arc<KeyStore>,
        revocations: Arc<dyn RevocationStore>,
        refresh_tokens: Arc<dyn RefreshStore>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            keys,
            revocations,
            refresh_tokens,
            clock,
            config,
        }
    }

    /// Signature, then blacklist, then expiry.
    pub async fn validate_access(&self, token: &str) -> Result<Claims, AuthError> {
        let claims: Claims = self.keys.decode(token)?;

        let revoked = bounded(
            self.config.store_timeout,
            "check_revocation",
            self.revocations.exists(&token_id(token)),
        )
        .await?;
        if revoked {
            debug!(subject = %claims.sub, token = %short_id(token), "Rejected revoked access token");
            return Err(AuthError::Revoked);
        }

        if claims.exp < self.clock.now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }

    /// Expiry of a correctly signed access token, whether or not it is still
    /// valid. `None` for anything that does not verify.
    pub fn access_expiry(&self, token: &str) -> Option<(Claims, DateTime<Utc>)> {
        let claims: Claims = self.keys.decode(token).ok()?;
        let expires_at = claims.expires_at()?;
        Some((claims, expires_at))
    }

    pub async fn validate_refresh(&self, token: &str) -> Result<RefreshRecord, AuthError> {
        let record = bounded(
            self.config.store_timeout,
            "find_refresh_token",
            self.refresh_tokens.find_by_token(token),
        )
        .await?
        .ok_or(AuthError::NotFound)?;

        if record.revoked {
            return Err(AuthError::Revoked);
        }
        if record.is_expired_at(self.clock.now()) {
            return Err(AuthError::Expired);
        }

        Ok(record)
    }
}
