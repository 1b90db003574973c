use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use tracing::{debug, error, warn};

use crate::error::{AppError, AuthError};

const MIN_RECOMMENDED_SECRET_LEN: usize = 32;

/// Process-wide signing key for access tokens. Loaded once at startup.
pub struct KeyStore {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl KeyStore {
    pub fn from_secret(secret: &str) -> Result<Self, AppError> {
        if secret.trim().is_empty() {
            return Err(AppError::ConfigError("auth.jwt_secret must not be empty".into()));
        }
        if secret.len() < MIN_RECOMMENDED_SECRET_LEN {
            warn!(
                length = secret.len(),
                "JWT secret is shorter than {} bytes", MIN_RECOMMENDED_SECRET_LEN
            );
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Raw signature over `message`, base64url encoded.
    pub fn sign(&self, message: &[u8]) -> Result<String, AuthError> {
        jsonwebtoken::crypto::sign(message, &self.encoding_key, self.algorithm).map_err(|e| {
            error!("Signing failed: {}", e);
            AuthError::Signing
        })
    }

    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        jsonwebtoken::crypto::verify(signature, message, &self.decoding_key, self.algorithm)
            .unwrap_or(false)
    }

    pub fn encode<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key).map_err(|e| {
            error!("JWT encoding failed: {}", e);
            AuthError::Signing
        })
    }

    /// Verifies the signature and decodes the payload. Expiry is not checked
    /// here; callers compare against their own clock.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, AuthError> {
        decode::<T>(token, &self.decoding_key, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("JWT rejected: {}", e);
                AuthError::InvalidSignature
            })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::new();
        validation
    }
}
