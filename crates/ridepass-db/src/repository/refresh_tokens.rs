//! Refresh token ledger operations

use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{ClientMeta, IssuedToken, RefreshToken};
use crate::token::{generate_plaintext, hash_token};
use crate::utils::format_datetime;

use super::{DEFAULT_REFRESH_TTL, Database, effective_ttl};

const SELECT_COLUMNS: &str =
    "id, user_id, token_hash, issued_at, expires_at, revoked_at, user_agent, ip";

impl Database {
    // ==================== Refresh Token Operations ====================

    /// Issue a refresh token for a user
    pub async fn create_refresh_token(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        let mut tx = self.pool.begin().await?;
        let issued = insert_refresh_token(&mut tx, user_id, meta, ttl, now).await?;
        tx.commit().await?;

        debug!("Issued refresh token {} for user {}", issued.record.id, user_id);
        Ok(issued)
    }

    /// Atomically revoke `old_id` and issue its successor
    ///
    /// The transaction opens with a write against the old row so that it holds
    /// SQLite's write lock before anything is read; a concurrent rotation of the
    /// same token waits on the busy timeout and then sees the row revoked.
    /// Dropping the future before commit rolls everything back.
    pub async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        let old_id_str = old_id.to_string();
        let user_id_str = user_id.to_string();
        let now_str = format_datetime(now);

        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = revoked_at
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&old_id_str)
        .bind(&user_id_str)
        .execute(&mut *tx)
        .await?;

        if locked.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("refresh token {}", old_id)));
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM refresh_tokens WHERE id = ? AND user_id = ?",
            SELECT_COLUMNS
        ))
        .bind(&old_id_str)
        .bind(&user_id_str)
        .fetch_optional(&mut *tx)
        .await?;

        let current = match row {
            Some(row) => RefreshToken::try_from(&row)?,
            None => return Err(DbError::NotFound(format!("refresh token {}", old_id))),
        };

        if !current.is_live(now) {
            debug!("Rejected rotation of dead refresh token {}", old_id);
            return Err(DbError::InvalidToken);
        }

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?
            WHERE id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(&now_str)
        .bind(&old_id_str)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            warn!("Refresh token {} revoked underneath an active rotation", old_id);
            return Err(DbError::RotateConflict);
        }

        let issued = insert_refresh_token(&mut tx, user_id, meta, ttl, now).await?;
        tx.commit().await?;

        debug!("Rotated refresh token {} -> {}", old_id, issued.record.id);
        Ok(issued)
    }

    /// Look up a refresh token by its hash
    pub async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, DbError> {
        let result = sqlx::query(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = ?",
            SELECT_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        result.map(|row| RefreshToken::try_from(&row)).transpose()
    }

    /// Revoke a refresh token by id
    ///
    /// Revoking an unknown or already revoked token reports not-found and changes nothing.
    pub async fn revoke_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?
            WHERE id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(format_datetime(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("live refresh token {}", id)));
        }
        Ok(())
    }

    /// Revoke a refresh token by its hash
    pub async fn revoke_refresh_token_by_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?
            WHERE token_hash = ? AND revoked_at IS NULL
            "#,
        )
        .bind(format_datetime(now))
        .bind(token_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("live refresh token".to_string()));
        }
        Ok(())
    }

    /// Revoke every outstanding refresh token of a user
    pub async fn revoke_all_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?
            WHERE user_id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(format_datetime(now))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete refresh tokens that expired strictly before `now`
    pub async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
            .bind(format_datetime(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

async fn insert_refresh_token(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Uuid,
    meta: &ClientMeta,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<IssuedToken<RefreshToken>, DbError> {
    // Stored timestamps carry microseconds; keep the returned record identical.
    let now = now.trunc_subsecs(6);
    let plaintext = generate_plaintext();
    let record = RefreshToken {
        id: Uuid::new_v4(),
        user_id,
        token_hash: hash_token(&plaintext),
        issued_at: now,
        expires_at: now + effective_ttl(ttl, DEFAULT_REFRESH_TTL),
        revoked_at: None,
        user_agent: meta.user_agent.clone(),
        ip: meta.ip,
    };

    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at, revoked_at, user_agent, ip)
        VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.user_id.to_string())
    .bind(&record.token_hash)
    .bind(format_datetime(record.issued_at))
    .bind(format_datetime(record.expires_at))
    .bind(&record.user_agent)
    .bind(record.ip.map(|ip| ip.to_string()))
    .execute(&mut **tx)
    .await?;

    Ok(IssuedToken { plaintext, record })
}
