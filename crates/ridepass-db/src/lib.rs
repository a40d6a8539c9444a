//! Ridepass Database Layer
//!
//! Persistent ledgers for refresh and verification tokens plus the user
//! records they belong to, using SQLite via sqlx. Services consume the
//! capability traits in [`store`]; [`memory`] provides drop-in in-memory
//! implementations.

pub mod error;
pub mod memory;
pub mod models;
pub mod repository;
pub mod store;
pub mod token;
pub mod utils;

pub use error::DbError;
pub use memory::{InMemoryRefreshTokenStore, InMemoryUserStore, InMemoryVerificationTokenStore};
pub use models::*;
pub use repository::{DEFAULT_REFRESH_TTL, DEFAULT_VERIFICATION_TTL, Database, DatabaseOptions};
pub use store::{RefreshTokenStore, UserStore, VerificationTokenStore};
pub use token::{generate_plaintext, hash_token};
pub use utils::with_deadline;

/// Re-export sqlx types for convenience
pub use sqlx::SqlitePool;
