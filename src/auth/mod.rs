//! Token lifecycle: issuing, validating, rotating and revoking access and
//! refresh tokens, plus the HTTP handlers that expose it.

mod clock;
mod credentials;
mod keys;
mod service;
mod token;
mod validator;
pub mod handlers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{BcryptHasher, PasswordHasher};
pub use keys::KeyStore;
pub use service::SessionManager;
pub use token::{token_id, Claims, TokenConfig, TokenIssuer, TokenPair};
pub use validator::TokenValidator;
