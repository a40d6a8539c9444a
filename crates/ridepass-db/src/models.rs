//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DbError;
use crate::utils::{parse_datetime, parse_optional_datetime};

/// Error type for parsing models from strings
#[derive(Debug, Clone)]
pub enum ParseError {
    InvalidUserRole(String),
    InvalidPurpose(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidUserRole(s) => write!(f, "Invalid user role: {}", s),
            ParseError::InvalidPurpose(s) => write!(f, "Invalid verification purpose: {}", s),
        }
    }
}

impl std::error::Error for ParseError {}

/// User role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Rider,
    Driver,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Rider => "rider",
            UserRole::Driver => "driver",
            UserRole::Admin => "admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }

    /// Roles that may sign themselves up
    pub fn can_self_register(&self) -> bool {
        matches!(self, UserRole::Rider | UserRole::Driver)
    }
}

impl FromStr for UserRole {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rider" => Ok(UserRole::Rider),
            "driver" => Ok(UserRole::Driver),
            "admin" => Ok(UserRole::Admin),
            _ => Err(ParseError::InvalidUserRole(s.to_string())),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a verification token may be redeemed for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPurpose {
    RiderConfirm,
    DriverConfirm,
    PasswordReset,
}

impl VerificationPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPurpose::RiderConfirm => "rider_confirm",
            VerificationPurpose::DriverConfirm => "driver_confirm",
            VerificationPurpose::PasswordReset => "password_reset",
        }
    }

    /// Email confirmation purpose for a freshly registered role
    pub fn confirm_for(role: UserRole) -> Option<Self> {
        match role {
            UserRole::Rider => Some(VerificationPurpose::RiderConfirm),
            UserRole::Driver => Some(VerificationPurpose::DriverConfirm),
            UserRole::Admin => None,
        }
    }
}

impl FromStr for VerificationPurpose {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rider_confirm" => Ok(VerificationPurpose::RiderConfirm),
            "driver_confirm" => Ok(VerificationPurpose::DriverConfirm),
            "password_reset" => Ok(VerificationPurpose::PasswordReset),
            _ => Err(ParseError::InvalidPurpose(s.to_string())),
        }
    }
}

/// Client metadata recorded alongside issued tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub ip: Option<IpAddr>,
}

impl ClientMeta {
    pub fn new(user_agent: Option<&str>, ip: Option<IpAddr>) -> Self {
        let user_agent = user_agent
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .map(str::to_string);
        Self { user_agent, ip }
    }
}

/// Refresh token ledger row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub ip: Option<IpAddr>,
}

impl RefreshToken {
    /// Live iff not revoked and not yet expired
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Verification token ledger row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub purpose: VerificationPurpose,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub ip: Option<IpAddr>,
}

impl VerificationToken {
    pub fn is_usable(&self, purpose: VerificationPurpose, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now && self.purpose == purpose
    }
}

/// A token record together with its one-time plaintext
///
/// The plaintext exists only here; it cannot be recovered from the record.
#[derive(Clone)]
pub struct IssuedToken<T> {
    pub plaintext: String,
    pub record: T,
}

impl<T: fmt::Debug> fmt::Debug for IssuedToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("plaintext", &"<redacted>")
            .field("record", &self.record)
            .finish()
    }
}

/// User model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub is_verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New user (for insertion)
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub is_active: bool,
}

/// Canonical form of an email address used for lookups
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ==================== TryFrom Implementations ====================

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, DbError> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| DbError::Corrupt(format!("{}: {}", column, e)))
}

fn parse_ip(row: &SqliteRow) -> Result<Option<IpAddr>, DbError> {
    let raw: Option<String> = row.try_get("ip")?;
    raw.map(|s| {
        s.parse::<IpAddr>()
            .map_err(|e| DbError::Corrupt(format!("ip: {}", e)))
    })
    .transpose()
}

impl TryFrom<&SqliteRow> for RefreshToken {
    type Error = DbError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(RefreshToken {
            id: parse_uuid(row, "id")?,
            user_id: parse_uuid(row, "user_id")?,
            token_hash: row.try_get("token_hash")?,
            issued_at: parse_datetime(&row.try_get::<String, _>("issued_at")?)?,
            expires_at: parse_datetime(&row.try_get::<String, _>("expires_at")?)?,
            revoked_at: parse_optional_datetime(row.try_get("revoked_at")?)?,
            user_agent: row.try_get("user_agent")?,
            ip: parse_ip(row)?,
        })
    }
}

impl TryFrom<&SqliteRow> for VerificationToken {
    type Error = DbError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let purpose: String = row.try_get("purpose")?;
        Ok(VerificationToken {
            id: parse_uuid(row, "id")?,
            user_id: parse_uuid(row, "user_id")?,
            purpose: purpose
                .parse()
                .map_err(|e: ParseError| DbError::Corrupt(e.to_string()))?,
            token_hash: row.try_get("token_hash")?,
            issued_at: parse_datetime(&row.try_get::<String, _>("issued_at")?)?,
            expires_at: parse_datetime(&row.try_get::<String, _>("expires_at")?)?,
            used_at: parse_optional_datetime(row.try_get("used_at")?)?,
            user_agent: row.try_get("user_agent")?,
            ip: parse_ip(row)?,
        })
    }
}

impl TryFrom<&SqliteRow> for User {
    type Error = DbError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let role: String = row.try_get("role")?;
        Ok(User {
            id: parse_uuid(row, "id")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            role: role
                .parse()
                .map_err(|e: ParseError| DbError::Corrupt(e.to_string()))?,
            is_verified: row.try_get("is_verified")?,
            is_active: row.try_get("is_active")?,
            created_at: parse_datetime(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_datetime(&row.try_get::<String, _>("updated_at")?)?,
        })
    }
}
