use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Startup error: {0}")]
    StartupError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Pool and connection failures only happen while acquiring resources at startup
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::StartupError(format!("database: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::StartupError(format!("migrations: {}", err))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::StartupError(format!("redis: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl AppError {
    /// Message shown to clients. Server faults never expose their detail.
    pub fn public_message(&self) -> String {
        match self {
            AppError::AuthError(e) if e.is_server_fault() => "Internal server error".to_string(),
            AppError::AuthError(AuthError::Storage(StorageError::Duplicate)) => {
                "Username or email already registered".to_string()
            }
            AppError::AuthError(e) => e.to_string(),
            AppError::ValidationError(e) => e.to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": self.public_message()
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials
                | AuthError::InvalidSignature
                | AuthError::Expired
                | AuthError::Revoked
                | AuthError::NotFound
                | AuthError::RefreshInvalid(_) => StatusCode::UNAUTHORIZED,
                AuthError::Storage(StorageError::Duplicate) => StatusCode::CONFLICT,
                AuthError::Storage(StorageError::Timeout) => StatusCode::SERVICE_UNAVAILABLE,
                AuthError::Storage(StorageError::Unavailable)
                | AuthError::Signing
                | AuthError::Issuance(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Every failure the token lifecycle can report. Driver errors are logged
/// where they happen and collapse into one of these kinds.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Token revoked")]
    Revoked,

    #[error("Token not found")]
    NotFound,

    #[error("Refresh token invalid: {0}")]
    RefreshInvalid(RefreshRejection),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Token signing failed")]
    Signing,

    #[error("Token issuance failed: {0}")]
    Issuance(IssuanceFailure),
}

impl AuthError {
    /// Only timeouts are worth a single retry by the transport layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Storage(StorageError::Timeout)
                | AuthError::Issuance(IssuanceFailure::Storage(StorageError::Timeout))
        )
    }

    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            AuthError::Storage(StorageError::Timeout | StorageError::Unavailable)
                | AuthError::Signing
                | AuthError::Issuance(_)
        )
    }

    /// Wraps a signing or storage failure raised while minting tokens.
    pub(crate) fn into_issuance(self) -> AuthError {
        match self {
            AuthError::Signing => AuthError::Issuance(IssuanceFailure::Signing),
            AuthError::Storage(e) => AuthError::Issuance(IssuanceFailure::Storage(e)),
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRejection {
    #[error("not found")]
    NotFound,

    #[error("revoked")]
    Revoked,

    #[error("expired")]
    Expired,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceFailure {
    #[error("signing failed")]
    Signing,

    #[error("{0}")]
    Storage(StorageError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage timed out")]
    Timeout,

    #[error("Storage unavailable")]
    Unavailable,

    #[error("Duplicate record")]
    Duplicate,
}

/// A request body that is missing required fields. Lists all of them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("missing required fields: {}", .missing.join(", "))]
pub struct ValidationError {
    pub missing: Vec<&'static str>,
}
