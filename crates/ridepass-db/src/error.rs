//! Database error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// Expired, already used/revoked, wrong purpose or unknown hash.
    /// Callers must not be able to tell these apart.
    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Concurrent rotation lost the race")]
    RotateConflict,

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Operation deadline elapsed")]
    Timeout,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Errors whose detail must stay in the logs and never reach a client.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            DbError::Storage(_) | DbError::Timeout | DbError::Migration(_) | DbError::Corrupt(_)
        )
    }
}
