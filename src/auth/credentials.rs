use tracing::error;

use crate::error::AppError;

/// Opaque password hashing capability.
pub trait PasswordHasher: Send + Sync {
    fn hash_password(&self, plaintext: &str) -> Result<String, AppError>;

    /// False for a mismatch and for a hash that cannot be read.
    fn verify_password(&self, hash: &str, plaintext: &str) -> bool;
}

pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash_password(&self, plaintext: &str) -> Result<String, AppError> {
        bcrypt::hash(plaintext, self.cost).map_err(|e| {
            error!("Password hashing failed: {}", e);
            AppError::InternalError("password hashing failed".to_string())
        })
    }

    fn verify_password(&self, hash: &str, plaintext: &str) -> bool {
        match bcrypt::verify(plaintext, hash) {
            Ok(matches) => matches,
            Err(e) => {
                error!("Stored password hash unreadable: {}", e);
                false
            }
        }
    }
}
