//! Database repository implementation

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::DbError;
use crate::utils::with_deadline;

// Submodules
mod refresh_tokens;
mod users;
mod verification_tokens;

/// Refresh tokens issued with a non-positive TTL fall back to this
pub const DEFAULT_REFRESH_TTL: chrono::Duration = chrono::Duration::days(7);

/// Verification tokens issued with a non-positive TTL fall back to this
pub const DEFAULT_VERIFICATION_TTL: chrono::Duration = chrono::Duration::hours(24);

/// Connection pool tuning
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    /// Budget for a single store operation, transaction included
    pub operation_timeout: Duration,
    /// How long a writer waits on SQLite's database lock
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            operation_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    operation_timeout: Duration,
}

impl Database {
    /// Create a new database connection with default options
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        Self::connect(database_url, DatabaseOptions::default()).await
    }

    /// Create a new database connection
    pub async fn connect(database_url: &str, options: DatabaseOptions) -> Result<Self, DbError> {
        info!("Connecting to database: {}", database_url);

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        let db = Self {
            pool,
            operation_timeout: options.operation_timeout,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open a private in-memory database
    ///
    /// Every pooled connection to `:memory:` would see its own empty database,
    /// so the pool is pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self, DbError> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let db = Self {
            pool,
            operation_timeout: DatabaseOptions::default().operation_timeout,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get the underlying pool for advanced usage
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Budget applied to each store operation
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Run `fut` under this database's operation deadline
    pub(crate) async fn deadline<T, F>(&self, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        with_deadline(self.operation_timeout, fut).await
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                is_verified INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked_at TEXT,
                user_agent TEXT,
                ip TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires ON refresh_tokens(expires_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS verification_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                purpose TEXT NOT NULL
                    CHECK (purpose IN ('rider_confirm', 'driver_confirm', 'password_reset')),
                token_hash TEXT NOT NULL UNIQUE,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used_at TEXT,
                user_agent TEXT,
                ip TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_verification_tokens_user ON verification_tokens(user_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_verification_tokens_expires ON verification_tokens(expires_at)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(e.to_string()))?;
        }

        info!("Database migrations completed");
        Ok(())
    }
}

/// Substitute `fallback` for a non-positive TTL
pub(crate) fn effective_ttl(ttl: chrono::Duration, fallback: chrono::Duration) -> chrono::Duration {
    if ttl <= chrono::Duration::zero() {
        fallback
    } else {
        ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[test]
    fn test_effective_ttl() {
        let hour = chrono::Duration::hours(1);
        assert_eq!(effective_ttl(hour, DEFAULT_REFRESH_TTL), hour);
        assert_eq!(
            effective_ttl(chrono::Duration::zero(), DEFAULT_REFRESH_TTL),
            DEFAULT_REFRESH_TTL
        );
        assert_eq!(
            effective_ttl(-hour, DEFAULT_VERIFICATION_TTL),
            DEFAULT_VERIFICATION_TTL
        );
    }
}
