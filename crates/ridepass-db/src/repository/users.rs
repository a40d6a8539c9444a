//! User operations

use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{NewUser, User, UserRole, normalize_email};
use crate::repository::Database;
use crate::utils::format_datetime;

impl Database {
    // ==================== User Operations ====================

    /// Insert a new user
    pub async fn insert_user(&self, user: NewUser) -> Result<User, DbError> {
        let now = Utc::now().trunc_subsecs(6);
        let email = normalize_email(&user.email);

        // Check if user already exists
        let existing = self.get_user_by_email(&email).await?;
        if existing.is_some() {
            return Err(DbError::Duplicate(format!("User '{}' already exists", email)));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, role, is_verified, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("User '{}' already exists", email))
            }
            other => DbError::Storage(other),
        })?;

        Ok(User {
            id,
            email,
            password_hash: user.password_hash,
            role: user.role,
            is_verified: false,
            is_active: user.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a user by email (case-insensitive)
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        let result = sqlx::query(
            r#"
            SELECT id, email, password_hash, role, is_verified, is_active, created_at, updated_at
            FROM users
            WHERE email = ?
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        result.map(|row| User::try_from(&row)).transpose()
    }

    /// Get a user by ID
    pub async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, DbError> {
        let result = sqlx::query(
            r#"
            SELECT id, email, password_hash, role, is_verified, is_active, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        result.map(|row| User::try_from(&row)).transpose()
    }

    /// Update user role
    pub async fn update_user_role(&self, id: Uuid, role: UserRole) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET role = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(role.as_str())
        .bind(format_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the stored credential
    pub async fn update_user_password(&self, id: Uuid, password_hash: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(password_hash)
        .bind(format_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the email-verified flag
    pub async fn set_user_verified(&self, id: Uuid, verified: bool) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_verified = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(verified)
        .bind(format_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Activate or deactivate an account
    pub async fn set_user_active(&self, id: Uuid, active: bool) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(active)
        .bind(format_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
