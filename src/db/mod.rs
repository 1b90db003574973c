//! PostgreSQL persistence for users and refresh tokens.

pub mod models;
pub mod operations;

pub use models::{BlacklistEntry, NewUser, RefreshRecord, User};
pub use operations::{DbOperations, DbPoolStatus};
