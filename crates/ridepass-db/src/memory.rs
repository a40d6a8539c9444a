//! In-memory store implementations
//!
//! Same observable semantics as the SQLite ledgers. Each store keeps its rows
//! behind a single mutex, which makes rotation and consumption atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    ClientMeta, IssuedToken, NewUser, RefreshToken, User, UserRole, VerificationPurpose,
    VerificationToken, normalize_email,
};
use crate::repository::{DEFAULT_REFRESH_TTL, DEFAULT_VERIFICATION_TTL, effective_ttl};
use crate::store::{RefreshTokenStore, UserStore, VerificationTokenStore};
use crate::token::{generate_plaintext, hash_token};

#[derive(Clone, Default)]
pub struct InMemoryRefreshTokenStore {
    rows: Arc<Mutex<HashMap<Uuid, RefreshToken>>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(
        rows: &mut HashMap<Uuid, RefreshToken>,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> IssuedToken<RefreshToken> {
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
        rows.insert(record.id, record.clone());
        IssuedToken { plaintext, record }
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        let mut rows = self.rows.lock();
        Ok(Self::issue(&mut rows, user_id, meta, ttl, now))
    }

    async fn rotate(
        &self,
        old_id: Uuid,
        user_id: Uuid,
        meta: &ClientMeta,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken<RefreshToken>, DbError> {
        let mut rows = self.rows.lock();
        let old = rows
            .get_mut(&old_id)
            .filter(|row| row.user_id == user_id)
            .ok_or_else(|| DbError::NotFound(format!("refresh token {}", old_id)))?;

        if !old.is_live(now) {
            return Err(DbError::InvalidToken);
        }
        old.revoked_at = Some(now);

        Ok(Self::issue(&mut rows, user_id, meta, ttl, now))
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, DbError> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|row| row.token_hash == token_hash)
            .cloned())
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        match self.rows.lock().get_mut(&id) {
            Some(row) if row.revoked_at.is_none() => {
                row.revoked_at = Some(now);
                Ok(())
            }
            _ => Err(DbError::NotFound(format!("live refresh token {}", id))),
        }
    }

    async fn revoke_by_hash(&self, token_hash: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        match self
            .rows
            .lock()
            .values_mut()
            .find(|row| row.token_hash == token_hash && row.revoked_at.is_none())
        {
            Some(row) => {
                row.revoked_at = Some(now);
                Ok(())
            }
            None => Err(DbError::NotFound("live refresh token".to_string())),
        }
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let mut count = 0;
        for row in self.rows.lock().values_mut() {
            if row.user_id == user_id && row.revoked_at.is_none() {
                row.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| row.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryVerificationTokenStore {
    rows: Arc<Mutex<HashMap<Uuid, VerificationToken>>>,
}

impl InMemoryVerificationTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationTokenStore for InMemoryVerificationTokenStore {
    async fn create(
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
        self.rows.lock().insert(record.id, record.clone());
        Ok(IssuedToken { plaintext, record })
    }

    async fn validate_and_consume(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, DbError> {
        let token_hash = hash_token(plaintext);
        let mut rows = self.rows.lock();
        let row = rows
            .values_mut()
            .find(|row| row.token_hash == token_hash && row.is_usable(purpose, now))
            .ok_or(DbError::InvalidToken)?;
        row.used_at = Some(now);
        Ok(row.clone())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<VerificationToken>, DbError> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|row| row.token_hash == token_hash)
            .cloned())
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        match self.rows.lock().get_mut(&id) {
            Some(row) if row.used_at.is_none() => {
                row.used_at = Some(now);
                Ok(())
            }
            _ => Err(DbError::NotFound(format!("unused verification token {}", id))),
        }
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let mut count = 0;
        for row in self.rows.lock().values_mut() {
            if row.user_id == user_id && row.used_at.is_none() {
                row.used_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| row.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    users: Arc<Mutex<HashMap<Uuid, User>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<(), DbError>
    where
        F: FnOnce(&mut User),
    {
        let mut users = self.users.lock();
        let user = users
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("user {}", id)))?;
        apply(user);
        user.updated_at = Utc::now().trunc_subsecs(6);
        Ok(())
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn create_user(&self, user: NewUser) -> Result<User, DbError> {
        let email = normalize_email(&user.email);
        let mut users = self.users.lock();
        if users.values().any(|u| u.email == email) {
            return Err(DbError::Duplicate(format!("User '{}' already exists", email)));
        }

        let now = Utc::now().trunc_subsecs(6);
        let created = User {
            id: Uuid::new_v4(),
            email,
            password_hash: user.password_hash,
            role: user.role,
            is_verified: false,
            is_active: user.is_active,
            created_at: now,
            updated_at: now,
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        let email = normalize_email(email);
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, DbError> {
        Ok(self.users.lock().get(&id).cloned())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), DbError> {
        self.update(id, |u| u.password_hash = password_hash.to_string())
    }

    async fn set_role(&self, id: Uuid, role: UserRole) -> Result<(), DbError> {
        self.update(id, |u| u.role = role)
    }

    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<(), DbError> {
        self.update(id, |u| u.is_verified = verified)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), DbError> {
        self.update(id, |u| u.is_active = active)
    }
}
