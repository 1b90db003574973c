use async_trait::async_trait;
use authgate_server::auth::{
    token_id, BcryptHasher, Claims, Clock, KeyStore, ManualClock, PasswordHasher, SessionManager, TokenConfig,
};
use authgate_server::db::{NewUser, RefreshRecord};
use authgate_server::error::{AuthError, IssuanceFailure, RefreshRejection, StorageError};
use authgate_server::store::{
    MemoryRefreshStore, MemoryRevocationStore, MemoryUserStore, RefreshStore, RevocationStore, Stores,
    UserStore,
};
use chrono::{DateTime, Duration, Utc};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PASSWORD: &str = "correct-password";

mock! {
    pub Revocations {}

    #[async_trait]
    impl RevocationStore for Revocations {
        async fn set(&self, id: &str, ttl: std::time::Duration) -> Result<(), StorageError>;
        async fn exists(&self, id: &str) -> Result<bool, StorageError>;
    }
}

mock! {
    pub RefreshTokens {}

    #[async_trait]
    impl RefreshStore for RefreshTokens {
        async fn insert(&self, record: &RefreshRecord) -> Result<(), StorageError>;
        async fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError>;
        async fn compare_and_revoke(&self, token: &str) -> Result<bool, StorageError>;
        async fn rotate(&self, old_token: &str, replacement: &RefreshRecord) -> Result<bool, StorageError>;
        async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StorageError>;
    }
}

/// Blacklist whose calls never finish in time.
struct StalledRevocations;

#[async_trait]
impl RevocationStore for StalledRevocations {
    async fn set(&self, _id: &str, _ttl: std::time::Duration) -> Result<(), StorageError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(())
    }

    async fn exists(&self, _id: &str) -> Result<bool, StorageError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(false)
    }
}

/// Memory refresh store whose lookups stall, so concurrent refreshes both
/// pass validation and meet at the conditional rotation.
struct SlowLookupRefreshStore {
    inner: MemoryRefreshStore,
    lookup_delay: std::time::Duration,
    rotations: AtomicUsize,
    lost_rotations: AtomicUsize,
}

impl SlowLookupRefreshStore {
    fn new(lookup_delay: std::time::Duration) -> Self {
        Self {
            inner: MemoryRefreshStore::new(),
            lookup_delay,
            rotations: AtomicUsize::new(0),
            lost_rotations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RefreshStore for SlowLookupRefreshStore {
    async fn insert(&self, record: &RefreshRecord) -> Result<(), StorageError> {
        self.inner.insert(record).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError> {
        tokio::time::sleep(self.lookup_delay).await;
        self.inner.find_by_token(token).await
    }

    async fn compare_and_revoke(&self, token: &str) -> Result<bool, StorageError> {
        self.inner.compare_and_revoke(token).await
    }

    async fn rotate(&self, old_token: &str, replacement: &RefreshRecord) -> Result<bool, StorageError> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        let rotated = self.inner.rotate(old_token, replacement).await?;
        if !rotated {
            self.lost_rotations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(rotated)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        self.inner.purge_expired(before).await
    }
}

struct Harness {
    sessions: SessionManager,
    clock: Arc<ManualClock>,
}

async fn users_with_alice(hasher: &BcryptHasher) -> Arc<MemoryUserStore> {
    let users = Arc::new(MemoryUserStore::new());
    users
        .create_user(NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: hasher.hash_password(PASSWORD).unwrap(),
            scopes: vec!["read".to_string(), "write".to_string()],
        })
        .await
        .unwrap();
    users
}

async fn harness_with(
    revocations: Option<Arc<dyn RevocationStore>>,
    refresh_tokens: Option<Arc<dyn RefreshStore>>,
    config: TokenConfig,
) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let hasher = BcryptHasher::new(4);
    let users = users_with_alice(&hasher).await;

    let revocations: Arc<dyn RevocationStore> = match revocations {
        Some(store) => store,
        None => Arc::new(MemoryRevocationStore::new(clock.clone())),
    };
    let refresh_tokens: Arc<dyn RefreshStore> = match refresh_tokens {
        Some(store) => store,
        None => Arc::new(MemoryRefreshStore::new()),
    };
    let stores = Stores {
        revocations,
        refresh_tokens,
        users,
    };
    let keys = Arc::new(KeyStore::from_secret("session_flow_secret_with_some_length").unwrap());
    let sessions = SessionManager::new(keys, stores, Arc::new(hasher), clock.clone(), config);

    Harness { sessions, clock }
}

async fn harness() -> Harness {
    harness_with(None, None, TokenConfig::default()).await
}

#[test_log::test(tokio::test)]
async fn test_access_token_valid_through_expiry_second() {
    let h = harness().await;
    let (token, claims) = h
        .sessions
        .issuer()
        .issue_access_token(Claims::new("alice", ["read"]))
        .unwrap();

    assert_eq!(h.sessions.validate_access(&token).await.unwrap(), claims);

    h.clock.set(claims.expires_at().unwrap());
    assert_eq!(h.sessions.validate_access(&token).await.unwrap(), claims);

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.sessions.validate_access(&token).await, Err(AuthError::Expired));
}

#[test_log::test(tokio::test)]
async fn test_access_token_expired_after_sixteen_minutes() {
    let h = harness().await;
    let (token, claims) = h
        .sessions
        .issuer()
        .issue_access_token(Claims::new("alice", ["read"]))
        .unwrap();
    assert_eq!(claims.expires_at(), Some(h.clock.now() + Duration::minutes(15)));

    h.clock.advance(Duration::minutes(16));
    assert_eq!(h.sessions.validate_access(&token).await, Err(AuthError::Expired));
}

#[test_log::test(tokio::test)]
async fn test_login_issues_working_pair() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    let claims = h.sessions.validate_access(&pair.access_token).await.unwrap();
    assert_eq!(claims.sub, "alice");
    assert!(claims.scopes.contains("write"));
    assert_eq!(pair.refresh_expires_at, h.clock.now() + Duration::hours(24));

    let record = h.sessions.validator().validate_refresh(&pair.refresh_token).await.unwrap();
    assert_eq!(record.subject, "alice");

    // Email works as the login name too
    assert!(h.sessions.login("alice@example.com", PASSWORD).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_failed_logins_are_indistinguishable() {
    let h = harness().await;

    let wrong_password = h.sessions.login("alice", "wrongpass").await.unwrap_err();
    let unknown_user = h.sessions.login("nouser", "x").await.unwrap_err();

    assert_eq!(wrong_password, AuthError::InvalidCredentials);
    assert_eq!(wrong_password, unknown_user);
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
}

#[test_log::test(tokio::test)]
async fn test_logout_revokes_both_tokens() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    h.sessions.logout(&pair.access_token, &pair.refresh_token).await.unwrap();

    assert_eq!(h.sessions.validate_access(&pair.access_token).await, Err(AuthError::Revoked));
    assert_eq!(
        h.sessions.validator().validate_refresh(&pair.refresh_token).await,
        Err(AuthError::Revoked)
    );
    assert_eq!(
        h.sessions.refresh(&pair.access_token, &pair.refresh_token).await.unwrap_err(),
        AuthError::RefreshInvalid(RefreshRejection::Revoked)
    );
}

#[test_log::test(tokio::test)]
async fn test_logout_twice_succeeds() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    assert!(h.sessions.logout(&pair.access_token, &pair.refresh_token).await.is_ok());
    assert!(h.sessions.logout(&pair.access_token, &pair.refresh_token).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_logout_after_access_expiry_succeeds() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    h.clock.advance(Duration::minutes(20));
    assert!(h.sessions.logout(&pair.access_token, &pair.refresh_token).await.is_ok());
    assert_eq!(
        h.sessions.validator().validate_refresh(&pair.refresh_token).await,
        Err(AuthError::Revoked)
    );
}

#[test_log::test(tokio::test)]
async fn test_blacklist_outlives_token() {
    let clock = Arc::new(ManualClock::starting_now());
    let revocations = Arc::new(MemoryRevocationStore::new(clock.clone()));
    let hasher = BcryptHasher::new(4);
    let stores = Stores {
        revocations: revocations.clone(),
        refresh_tokens: Arc::new(MemoryRefreshStore::new()),
        users: users_with_alice(&hasher).await,
    };
    let keys = Arc::new(KeyStore::from_secret("session_flow_secret_with_some_length").unwrap());
    let sessions = SessionManager::new(keys, stores, Arc::new(hasher), clock.clone(), TokenConfig::default());

    let pair = sessions.login("alice", PASSWORD).await.unwrap();
    let entry = sessions.revoke_access_token(&pair.access_token).await.unwrap().unwrap();

    assert_eq!(entry.token_id, token_id(&pair.access_token));
    assert!(entry.blacklisted_until >= pair.access_expires_at);
    let stored_until = revocations.blacklisted_until(&entry.token_id).await.unwrap();
    assert!(stored_until >= pair.access_expires_at);

    // Still revoked in the token's final valid second
    clock.set(pair.access_expires_at);
    assert_eq!(sessions.validate_access(&pair.access_token).await, Err(AuthError::Revoked));
}

#[test_log::test(tokio::test)]
async fn test_refresh_rotates_and_kills_old_pair() {
    let h = harness().await;
    let first = h.sessions.login("alice", PASSWORD).await.unwrap();

    h.clock.advance(Duration::minutes(5));
    let second = h.sessions.refresh(&first.access_token, &first.refresh_token).await.unwrap();

    assert_ne!(second.refresh_token, first.refresh_token);
    assert_eq!(h.sessions.validate_access(&second.access_token).await.unwrap().sub, "alice");
    assert_eq!(h.sessions.validate_access(&first.access_token).await, Err(AuthError::Revoked));

    assert_eq!(
        h.sessions.refresh(&first.access_token, &first.refresh_token).await.unwrap_err(),
        AuthError::RefreshInvalid(RefreshRejection::Revoked)
    );
    assert!(h.sessions.validator().validate_refresh(&second.refresh_token).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_refresh_works_with_expired_access_token() {
    let h = harness().await;
    let first = h.sessions.login("alice", PASSWORD).await.unwrap();

    h.clock.advance(Duration::hours(1));
    let second = h.sessions.refresh(&first.access_token, &first.refresh_token).await.unwrap();
    assert!(h.sessions.validate_access(&second.access_token).await.is_ok());

    let third = h.sessions.refresh("", &second.refresh_token).await.unwrap();
    assert!(h.sessions.validate_access(&third.access_token).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_refresh_has_one_winner() {
    let refresh_tokens = Arc::new(SlowLookupRefreshStore::new(std::time::Duration::from_millis(50)));
    let h = harness_with(None, Some(refresh_tokens.clone()), TokenConfig::default()).await;
    let sessions = Arc::new(h.sessions);
    let pair = sessions.login("alice", PASSWORD).await.unwrap();

    // Both lookups are in flight before either rotation runs
    let spawn_refresh = |sessions: Arc<SessionManager>, access: String, refresh: String| {
        tokio::spawn(async move { sessions.refresh(&access, &refresh).await })
    };
    let a = spawn_refresh(sessions.clone(), pair.access_token.clone(), pair.refresh_token.clone());
    let b = spawn_refresh(sessions.clone(), pair.access_token.clone(), pair.refresh_token.clone());
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AuthError::RefreshInvalid(RefreshRejection::Revoked)))));
    assert_eq!(refresh_tokens.rotations.load(Ordering::SeqCst), 2);
    assert_eq!(refresh_tokens.lost_rotations.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_refresh_unknown_token_not_found() {
    let h = harness().await;
    assert_eq!(
        h.sessions.refresh("", "never-issued").await.unwrap_err(),
        AuthError::RefreshInvalid(RefreshRejection::NotFound)
    );
}

#[test_log::test(tokio::test)]
async fn test_refresh_expired_token_rejected_and_purged() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    h.clock.advance(Duration::hours(25));
    assert_eq!(
        h.sessions.refresh(&pair.access_token, &pair.refresh_token).await.unwrap_err(),
        AuthError::RefreshInvalid(RefreshRejection::Expired)
    );

    assert_eq!(h.sessions.purge_expired_refresh_tokens().await.unwrap(), 1);
    assert_eq!(
        h.sessions.refresh(&pair.access_token, &pair.refresh_token).await.unwrap_err(),
        AuthError::RefreshInvalid(RefreshRejection::NotFound)
    );
}

#[test_log::test(tokio::test)]
async fn test_refresh_ignores_other_subjects_access_token() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();
    let (stranger, _) = h
        .sessions
        .issuer()
        .issue_access_token(Claims::new("mallory", ["read"]))
        .unwrap();

    assert!(h.sessions.refresh(&stranger, &pair.refresh_token).await.is_ok());
    assert!(h.sessions.validate_access(&stranger).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_logout_keeps_refresh_revocation_when_blacklist_fails() {
    let mut revocations = MockRevocations::new();
    revocations
        .expect_set()
        .returning(|_, _| Err(StorageError::Unavailable));
    let refresh_tokens = Arc::new(MemoryRefreshStore::new());

    let h = harness_with(
        Some(Arc::new(revocations)),
        Some(refresh_tokens.clone()),
        TokenConfig::default(),
    )
    .await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    assert_eq!(
        h.sessions.logout(&pair.access_token, &pair.refresh_token).await,
        Err(AuthError::Storage(StorageError::Unavailable))
    );
    let record = refresh_tokens.find_by_token(&pair.refresh_token).await.unwrap().unwrap();
    assert!(record.revoked);
}

#[test_log::test(tokio::test)]
async fn test_logout_keeps_blacklist_when_refresh_revocation_fails() {
    let mut refresh_tokens = MockRefreshTokens::new();
    refresh_tokens.expect_insert().returning(|_| Ok(()));
    refresh_tokens
        .expect_compare_and_revoke()
        .returning(|_| Err(StorageError::Timeout));

    let h = harness_with(None, Some(Arc::new(refresh_tokens)), TokenConfig::default()).await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();

    let err = h.sessions.logout(&pair.access_token, &pair.refresh_token).await.unwrap_err();
    assert_eq!(err, AuthError::Storage(StorageError::Timeout));
    assert!(err.is_retryable());
    assert_eq!(h.sessions.validate_access(&pair.access_token).await, Err(AuthError::Revoked));
}

#[test_log::test(tokio::test)]
async fn test_login_returns_nothing_when_refresh_insert_fails() {
    let mut refresh_tokens = MockRefreshTokens::new();
    refresh_tokens
        .expect_insert()
        .returning(|_| Err(StorageError::Unavailable));

    let h = harness_with(None, Some(Arc::new(refresh_tokens)), TokenConfig::default()).await;

    let err = h.sessions.login("alice", PASSWORD).await.unwrap_err();
    assert_eq!(err, AuthError::Issuance(IssuanceFailure::Storage(StorageError::Unavailable)));
    assert!(!err.is_retryable());
}

#[test_log::test(tokio::test)]
async fn test_refresh_returns_nothing_when_rotation_fails() {
    let h = harness().await;
    let pair = h.sessions.login("alice", PASSWORD).await.unwrap();
    let record = h.sessions.validator().validate_refresh(&pair.refresh_token).await.unwrap();

    let mut refresh_tokens = MockRefreshTokens::new();
    refresh_tokens
        .expect_find_by_token()
        .returning(move |_| Ok(Some(record.clone())));
    refresh_tokens
        .expect_rotate()
        .returning(|_, _| Err(StorageError::Timeout));

    let failing = harness_with(None, Some(Arc::new(refresh_tokens)), TokenConfig::default()).await;
    let err = failing.sessions.refresh("", &pair.refresh_token).await.unwrap_err();
    assert_eq!(err, AuthError::Issuance(IssuanceFailure::Storage(StorageError::Timeout)));
    assert!(err.is_retryable());
}

#[test_log::test(tokio::test)]
async fn test_stalled_store_times_out() {
    let config = TokenConfig {
        store_timeout: std::time::Duration::from_millis(50),
        ..TokenConfig::default()
    };
    let h = harness_with(Some(Arc::new(StalledRevocations)), None, config).await;
    let (token, _) = h
        .sessions
        .issuer()
        .issue_access_token(Claims::new("alice", ["read"]))
        .unwrap();

    let err = h.sessions.validate_access(&token).await.unwrap_err();
    assert_eq!(err, AuthError::Storage(StorageError::Timeout));
    assert!(err.is_retryable());

    assert_eq!(
        h.sessions.revoke_access_token(&token).await,
        Err(AuthError::Storage(StorageError::Timeout))
    );
}
