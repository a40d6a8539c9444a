//! Verification token ledger operations

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{ClientMeta, IssuedToken, VerificationPurpose, VerificationToken};
use crate::token::{generate_plaintext, hash_token};
use crate::utils::format_datetime;

use super::{DEFAULT_VERIFICATION_TTL, Database, effective_ttl};

impl Database {
    // ==================== Verification Token Operations ====================

    /// Issue a single-use verification token
    pub async fn create_verification_token(
        &self,
        user_id: Uuid,
        purpose: VerificationPurpose,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<VerificationToken>, DbError> {
        let now = now.trunc_subsecs(6);
        let plaintext = generate_plaintext();
        let record = VerificationToken {
            id: Uuid::new_v4(),
            user_id,
            purpose,
            token_hash: hash_token(&plaintext),
            issued_at: now,
            expires_at: now + effective_ttl(ttl, DEFAULT_VERIFICATION_TTL),
            used_at: None,
            user_agent: meta.user_agent.clone(),
            ip: meta.ip,
        };

        sqlx::query(
            r#"
            INSERT INTO verification_tokens (id, user_id, purpose, token_hash, issued_at, expires_at, used_at, user_agent, ip)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(purpose.as_str())
        .bind(&record.token_hash)
        .bind(format_datetime(record.issued_at))
        .bind(format_datetime(record.expires_at))
        .bind(&record.user_agent)
        .bind(record.ip.map(|ip| ip.to_string()))
        .execute(&self.pool)
        .await?;

        debug!(
            "Issued {} token {} for user {}",
            purpose.as_str(),
            record.id,
            user_id
        );
        Ok(IssuedToken { plaintext, record })
    }

    /// Redeem a verification token
    ///
    /// A single conditional UPDATE both checks and consumes the row. Wrong hash,
    /// wrong purpose, reuse and expiry all end in the same `InvalidToken`.
    pub async fn consume_verification_token(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, DbError> {
        let now_str = format_datetime(now);
        let row = sqlx::query(
            r#"
            UPDATE verification_tokens
            SET used_at = ?
            WHERE token_hash = ?
              AND purpose = ?
              AND used_at IS NULL
              AND expires_at > ?
            RETURNING id, user_id, purpose, token_hash, issued_at, expires_at, used_at, user_agent, ip
            "#,
        )
        .bind(&now_str)
        .bind(hash_token(plaintext))
        .bind(purpose.as_str())
        .bind(&now_str)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => VerificationToken::try_from(&row),
            None => Err(DbError::InvalidToken),
        }
    }

    /// Look up a verification token by its hash
    pub async fn find_verification_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<VerificationToken>, DbError> {
        let result = sqlx::query(
            r#"
            SELECT id, user_id, purpose, token_hash, issued_at, expires_at, used_at, user_agent, ip
            FROM verification_tokens
            WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        result.map(|row| VerificationToken::try_from(&row)).transpose()
    }

    /// Mark a verification token used without redeeming it
    pub async fn revoke_verification_token(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_tokens
            SET used_at = ?
            WHERE id = ? AND used_at IS NULL
            "#,
        )
        .bind(format_datetime(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("unused verification token {}", id)));
        }
        Ok(())
    }

    /// Mark every unused verification token of a user as used
    pub async fn revoke_all_verification_tokens_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_tokens
            SET used_at = ?
            WHERE user_id = ? AND used_at IS NULL
            "#,
        )
        .bind(format_datetime(now))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete verification tokens that expired strictly before `now`
    pub async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM verification_tokens WHERE expires_at < ?")
            .bind(format_datetime(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
