use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::token::{short_id, token_id, Claims, TokenConfig, TokenIssuer, TokenPair};
use super::validator::TokenValidator;
use super::{Clock, KeyStore, PasswordHasher};
use crate::db::models::BlacklistEntry;
use crate::error::{AuthError, RefreshRejection};
use crate::store::{bounded, Stores};

/// Login, logout and refresh over the token issuer, validator and stores.
///
/// Holds no per-request state; everything that outlives a request lives in
/// one of the stores.
pub struct SessionManager {
    issuer: TokenIssuer,
    validator: TokenValidator,
    stores: Stores,
    passwords: Arc<dyn PasswordHasher>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
    // Checked against when the user does not exist, so both paths cost a hash
    decoy_hash: Option<String>,
}

impl SessionManager {
    pub fn new(
        keys: Arc<KeyStore>,
        stores: Stores,
        passwords: Arc<dyn PasswordHasher>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        let issuer = TokenIssuer::new(
            keys.clone(),
            stores.refresh_tokens.clone(),
            clock.clone(),
            config.clone(),
        );
        let validator = TokenValidator::new(
            keys,
            stores.revocations.clone(),
            stores.refresh_tokens.clone(),
            clock.clone(),
            config.clone(),
        );
        let decoy_hash = match passwords.hash_password(&Uuid::new_v4().to_string()) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("Could not prepare decoy password hash: {}", e);
                None
            }
        };

        Self {
            issuer,
            validator,
            stores,
            passwords,
            clock,
            config,
            decoy_hash,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Checks credentials and issues a fresh token pair. A wrong password and
    /// an unknown user produce the same error.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        let user = bounded(
            self.config.store_timeout,
            "find_user",
            self.stores.users.find_by_username_or_email(username),
        )
        .await?;

        let hash = match &user {
            Some(user) => Some(user.password_hash.clone()),
            None => self.decoy_hash.clone(),
        };
        let verified = match hash {
            Some(hash) => self.check_password(hash, password.to_string()).await,
            None => false,
        };

        let user = match user {
            Some(user) if verified => user,
            _ => {
                info!(login = %username, "Login rejected");
                return Err(AuthError::InvalidCredentials);
            }
        };

        let pair = self.issue_pair(Claims::new(user.username.clone(), user.scopes.clone())).await?;
        info!(subject = %user.username, "Login succeeded");
        Ok(pair)
    }

    /// Revokes both tokens. Both writes are always attempted; a failure in
    /// one never undoes the other.
    pub async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<(), AuthError> {
        let access = self.revoke_access_token(access_token).await;
        let refresh = self.revoke_refresh_token(refresh_token).await;

        match (access, refresh) {
            (Ok(_), Ok(())) => {
                info!(token = %short_id(access_token), "Logout completed");
                Ok(())
            }
            (Err(e), Ok(())) => {
                warn!(error = %e, "Logout revoked the refresh token but not the access token");
                Err(e)
            }
            (Ok(_), Err(e)) => {
                warn!(error = %e, "Logout blacklisted the access token but not the refresh token");
                Err(e)
            }
            (Err(e), Err(_)) => {
                error!(error = %e, "Logout failed to revoke either token");
                Err(e)
            }
        }
    }

    /// Exchanges a live refresh token for a new pair and retires the old one.
    /// The access token only matters if it verifies: then it is blacklisted.
    pub async fn refresh(&self, access_token: &str, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let record = self
            .validator
            .validate_refresh(refresh_token)
            .await
            .map_err(|e| match e {
                AuthError::NotFound => AuthError::RefreshInvalid(RefreshRejection::NotFound),
                AuthError::Revoked => {
                    warn!(token = %short_id(refresh_token), "Revoked refresh token presented");
                    AuthError::RefreshInvalid(RefreshRejection::Revoked)
                }
                AuthError::Expired => AuthError::RefreshInvalid(RefreshRejection::Expired),
                other => other,
            })?;

        if let Some((claims, expires_at)) = self.validator.access_expiry(access_token) {
            if claims.sub == record.subject {
                self.blacklist(access_token, Some(expires_at)).await?;
            } else {
                warn!(
                    subject = %record.subject,
                    presented = %claims.sub,
                    "Access token presented with another subject's refresh token"
                );
            }
        }

        let (new_access, claims) = self
            .issuer
            .issue_access_token(Claims::new(record.subject.clone(), record.scopes.clone()))
            .map_err(AuthError::into_issuance)?;
        let replacement = self
            .issuer
            .mint_refresh_record(&claims)
            .map_err(AuthError::into_issuance)?;

        let rotated = bounded(
            self.config.store_timeout,
            "rotate_refresh_token",
            self.stores.refresh_tokens.rotate(refresh_token, &replacement),
        )
        .await
        .map_err(|e| AuthError::Storage(e).into_issuance())?;

        if !rotated {
            warn!(subject = %record.subject, "Refresh token replayed during rotation");
            return Err(AuthError::RefreshInvalid(RefreshRejection::Revoked));
        }

        info!(subject = %record.subject, "Rotated refresh token");
        Ok(TokenPair::new(new_access, &claims, &replacement))
    }

    /// Blacklists an access token until it would have expired. Returns the
    /// entry written, or `None` if the token was already past expiry.
    pub async fn revoke_access_token(&self, access_token: &str) -> Result<Option<BlacklistEntry>, AuthError> {
        let expires_at = self.validator.access_expiry(access_token).map(|(_, exp)| exp);
        self.blacklist(access_token, expires_at).await
    }

    /// Drops refresh records that can no longer be used.
    pub async fn purge_expired_refresh_tokens(&self) -> Result<u64, AuthError> {
        let purged = bounded(
            self.config.store_timeout,
            "purge_refresh_tokens",
            self.stores.refresh_tokens.purge_expired(self.clock.now()),
        )
        .await?;

        info!(purged, "Purged expired refresh tokens");
        Ok(purged)
    }

    pub async fn validate_access(&self, access_token: &str) -> Result<Claims, AuthError> {
        self.validator.validate_access(access_token).await
    }

    async fn blacklist(
        &self,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<BlacklistEntry>, AuthError> {
        let now = self.clock.now();
        let expires_at = match expires_at {
            Some(expires_at) => expires_at,
            None => {
                // Unverifiable tokens get the longest lifetime a real one could have
                warn!(token = %short_id(access_token), "Blacklisting unverifiable access token");
                now + self.config.access_ttl
            }
        };

        if expires_at < now {
            debug!(token = %short_id(access_token), "Access token already expired");
            return Ok(None);
        }

        let entry = BlacklistEntry::covering(token_id(access_token), expires_at);
        let Some(ttl) = entry.ttl_from(now) else {
            return Ok(None);
        };

        bounded(
            self.config.store_timeout,
            "blacklist_access_token",
            self.stores.revocations.set(&entry.token_id, ttl),
        )
        .await?;

        debug!(token = %short_id(access_token), until = %entry.blacklisted_until, "Blacklisted access token");
        Ok(Some(entry))
    }

    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<(), AuthError> {
        let revoked = bounded(
            self.config.store_timeout,
            "revoke_refresh_token",
            self.stores.refresh_tokens.compare_and_revoke(refresh_token),
        )
        .await?;

        if !revoked {
            debug!(token = %short_id(refresh_token), "Refresh token already revoked or unknown");
        }
        Ok(())
    }

    async fn issue_pair(&self, claims: Claims) -> Result<TokenPair, AuthError> {
        let (access_token, claims) = self
            .issuer
            .issue_access_token(claims)
            .map_err(AuthError::into_issuance)?;
        let refresh = self
            .issuer
            .issue_refresh_token(&claims)
            .await
            .map_err(AuthError::into_issuance)?;

        Ok(TokenPair::new(access_token, &claims, &refresh))
    }

    async fn check_password(&self, hash: String, password: String) -> bool {
        let passwords = self.passwords.clone();
        match tokio::task::spawn_blocking(move || passwords.verify_password(&hash, &password)).await {
            Ok(verified) => verified,
            Err(e) => {
                error!("Password check task failed: {}", e);
                false
            }
        }
    }
}
