//! Capability traits over the persistent ledgers
//!
//! Services depend on these traits rather than on [`Database`] so that the
//! SQLite implementation and the in-memory one in [`crate::memory`] are
//! interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    ClientMeta, IssuedToken, NewUser, RefreshToken, User, UserRole, VerificationPurpose,
    VerificationToken,
};
use crate::repository::Database;

/// Ledger of long-lived rotating session tokens
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Issue a token; the plaintext is returned exactly once
    async fn create(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError>;

    /// Revoke `old_id` and issue its successor as one unit of work
    ///
    /// Missing row: `NotFound`. Expired or revoked row: `InvalidToken`.
    /// Lost race on the revoke: `RotateConflict`.
    async fn rotate(
        &self,
        old_id: Uuid,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, DbError>;

    /// Already revoked or unknown tokens report `NotFound`
    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError>;

    async fn revoke_by_hash(&self, token_hash: &str, now: DateTime<Utc>) -> Result<(), DbError>;

    async fn revoke_all_for_user(&self, user_id: Uuid, now: DateTime<Utc>)
    -> Result<u64, DbError>;

    /// Remove rows with `expires_at < now`, revoked or not
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

/// Ledger of single-use confirmation and reset tokens
#[async_trait]
pub trait VerificationTokenStore: Send + Sync {
    async fn create(
        &self,
        user_id: Uuid,
        purpose: VerificationPurpose,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<VerificationToken>, DbError>;

    /// Mark the token used if, and only if, it is usable for `purpose` at `now`
    ///
    /// Every failure cause yields the same `InvalidToken`.
    async fn validate_and_consume(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, DbError>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<VerificationToken>, DbError>;

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError>;

    async fn revoke_all_for_user(&self, user_id: Uuid, now: DateTime<Utc>)
    -> Result<u64, DbError>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

/// User and role mutations consumed by the auth flows
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: NewUser) -> Result<User, DbError>;

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, DbError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, DbError>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), DbError>;

    async fn set_role(&self, id: Uuid, role: UserRole) -> Result<(), DbError>;

    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<(), DbError>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), DbError>;
}

// ==================== SQLite implementation ====================

#[async_trait]
impl RefreshTokenStore for Database {
    async fn create(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        self.deadline(self.create_refresh_token(user_id, meta, ttl, now))
            .await
    }

    async fn rotate(
        &self,
        old_id: Uuid,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        self.deadline(self.rotate_refresh_token(old_id, user_id, meta, ttl, now))
            .await
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, DbError> {
        self.deadline(self.find_refresh_token_by_hash(token_hash))
            .await
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        self.deadline(self.revoke_refresh_token(id, now)).await
    }

    async fn revoke_by_hash(&self, token_hash: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.deadline(self.revoke_refresh_token_by_hash(token_hash, now))
            .await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        self.deadline(self.revoke_all_refresh_tokens_for_user(user_id, now))
            .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        self.deadline(self.delete_expired_refresh_tokens(now)).await
    }
}

#[async_trait]
impl VerificationTokenStore for Database {
    async fn create(
        &self,
        user_id: Uuid,
        purpose: VerificationPurpose,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<VerificationToken>, DbError> {
        self.deadline(self.create_verification_token(user_id, purpose, meta, ttl, now))
            .await
    }

    async fn validate_and_consume(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, DbError> {
        self.deadline(self.consume_verification_token(plaintext, purpose, now))
            .await
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<VerificationToken>, DbError> {
        self.deadline(self.find_verification_token_by_hash(token_hash))
            .await
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        self.deadline(self.revoke_verification_token(id, now)).await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        self.deadline(self.revoke_all_verification_tokens_for_user(user_id, now))
            .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        self.deadline(self.delete_expired_verification_tokens(now))
            .await
    }
}

fn found(updated: bool, id: Uuid) -> Result<(), DbError> {
    if updated {
        Ok(())
    } else {
        Err(DbError::NotFound(format!("user {}", id)))
    }
}

#[async_trait]
impl UserStore for Database {
    async fn create_user(&self, user: NewUser) -> Result<User, DbError> {
        self.deadline(self.insert_user(user)).await
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        self.deadline(self.get_user_by_email(email)).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, DbError> {
        self.deadline(self.get_user_by_id(id)).await
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), DbError> {
        found(
            self.deadline(self.update_user_password(id, password_hash))
                .await?,
            id,
        )
    }

    async fn set_role(&self, id: Uuid, role: UserRole) -> Result<(), DbError> {
        found(self.deadline(self.update_user_role(id, role)).await?, id)
    }

    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<(), DbError> {
        found(self.deadline(self.set_user_verified(id, verified)).await?, id)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), DbError> {
        found(self.deadline(self.set_user_active(id, active)).await?, id)
    }
}
