//! Authentication flows
//!
//! [`AuthService`] ties the credential primitives to the token ledgers:
//! registration, login, refresh rotation, logout, email confirmation and the
//! password reset/change flows. Every operation takes an explicit `now` so the
//! ledgers and signer agree on a single clock reading.

use chrono::{DateTime, Duration, Utc};
use ridepass_auth::{AccessClaims, AuthError, MAX_TTL_DAYS, PasswordHasher, TokenSigner};
use ridepass_db::{
    ClientMeta, DbError, IssuedToken, NewUser, RefreshToken, RefreshTokenStore, User, UserRole,
    UserStore, VerificationPurpose, VerificationToken, VerificationTokenStore, hash_token,
    normalize_email,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::error::CoreError;

pub const MIN_PASSWORD_CHARS: usize = 8;
pub const MAX_PASSWORD_CHARS: usize = 128;
const MAX_EMAIL_LEN: usize = 254;

/// Lifetimes of the persisted tokens
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub refresh_ttl: Duration,
    pub verification_ttl: Duration,
    pub password_reset_ttl: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            refresh_ttl: Duration::days(7),
            verification_ttl: Duration::minutes(30),
            password_reset_ttl: Duration::minutes(15),
        }
    }
}

/// Tokens handed to a client after login or refresh
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub access_claims: AccessClaims,
    pub refresh: IssuedToken<RefreshToken>,
}

/// A new account and the confirmation token to mail out
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub confirmation: IssuedToken<VerificationToken>,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    verification_tokens: Arc<dyn VerificationTokenStore>,
    signer: Arc<TokenSigner>,
    hasher: PasswordHasher,
    policy: AuthPolicy,
    /// Verified against when the email is unknown, so both paths cost the same
    dummy_hash: String,
}

fn validate_email(email: &str) -> Result<String, CoreError> {
    let email = normalize_email(email);
    let valid = email.len() <= MAX_EMAIL_LEN
        && !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(CoreError::Validation("invalid email address".into()));
    }
    Ok(email)
}

fn validate_password(password: &str) -> Result<(), CoreError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&len) {
        return Err(CoreError::Validation(format!(
            "password must be between {} and {} characters",
            MIN_PASSWORD_CHARS, MAX_PASSWORD_CHARS
        )));
    }
    Ok(())
}

/// Collapse ledger rejections into the single client-visible outcome
fn token_failure(e: DbError) -> CoreError {
    match e {
        DbError::NotFound(_) | DbError::InvalidToken => CoreError::InvalidOrExpired,
        DbError::RotateConflict => CoreError::RotationConflict,
        other => CoreError::Database(other),
    }
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        verification_tokens: Arc<dyn VerificationTokenStore>,
        signer: Arc<TokenSigner>,
        hasher: PasswordHasher,
        policy: AuthPolicy,
    ) -> Result<Self, CoreError> {
        let max_ttl = Duration::days(MAX_TTL_DAYS);
        let ttls = [
            policy.refresh_ttl,
            policy.verification_ttl,
            policy.password_reset_ttl,
        ];
        if ttls.iter().any(|ttl| *ttl <= Duration::zero() || *ttl > max_ttl) {
            return Err(AuthError::Config(format!(
                "token lifetimes must be positive and at most {} days",
                MAX_TTL_DAYS
            ))
            .into());
        }
        let dummy_hash = hasher.hash("ridepass-dummy-password")?;
        Ok(Self {
            users,
            refresh_tokens,
            verification_tokens,
            signer,
            hasher,
            policy,
            dummy_hash,
        })
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    /// Create an inactive rider or driver account and its confirmation token
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        role: UserRole,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Registration, CoreError> {
        let email = validate_email(email)?;
        validate_password(password)?;
        let purpose = VerificationPurpose::confirm_for(role)
            .filter(|_| role.can_self_register())
            .ok_or_else(|| CoreError::Validation(format!("role {} cannot self-register", role)))?;

        let password_hash = self.hasher.hash(password)?;
        let user = self
            .users
            .create_user(NewUser {
                email,
                password_hash,
                role,
                is_active: false,
            })
            .await
            .map_err(|e| match e {
                DbError::Duplicate(_) => CoreError::EmailAlreadyExists,
                other => CoreError::Database(other),
            })?;

        let confirmation = self
            .verification_tokens
            .create(user.id, purpose, meta, self.policy.verification_ttl, now)
            .await?;

        info!("Registered {} account: {}", role, user.id);
        audit::record(AuditEvent::Register, Some(user.id), true, meta);
        Ok(Registration { user, confirmation })
    }

    /// Check credentials and open a new session
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Session, CoreError> {
        let Some(user) = self.users.get_by_email(email).await? else {
            self.hasher.verify(password, &self.dummy_hash);
            warn!("Login attempt for unknown email");
            audit::record(AuditEvent::Login, None, false, meta);
            return Err(CoreError::InvalidCredentials);
        };

        if !self.hasher.verify(password, &user.password_hash) {
            warn!("Invalid password for user: {}", user.id);
            audit::record(AuditEvent::Login, Some(user.id), false, meta);
            return Err(CoreError::InvalidCredentials);
        }

        if !user.is_active {
            audit::record(AuditEvent::Login, Some(user.id), false, meta);
            return Err(CoreError::AccountInactive);
        }

        if self.hasher.needs_rehash(&user.password_hash) {
            self.rehash(&user, password).await;
        }

        let session = self.open_session(&user, meta, now).await?;
        audit::record(AuditEvent::Login, Some(user.id), true, meta);
        Ok(session)
    }

    async fn rehash(&self, user: &User, password: &str) {
        let result = match self.hasher.hash(password) {
            Ok(hash) => self
                .users
                .update_password(user.id, &hash)
                .await
                .map_err(CoreError::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => debug!("Upgraded password hash for user: {}", user.id),
            Err(e) => warn!("Failed to upgrade password hash for {}: {}", user.id, e),
        }
    }

    async fn open_session(
        &self,
        user: &User,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Session, CoreError> {
        let refresh = self
            .refresh_tokens
            .create(user.id, meta, self.policy.refresh_ttl, now)
            .await?;
        let access = self.signer.mint_access_at(user.id, user.role, now)?;

        Ok(Session {
            access_token: access.token,
            access_claims: access.claims,
            refresh,
        })
    }

    /// Exchange a refresh token for a new session, revoking the old token
    ///
    /// The access token carries the user's current role, not the one the
    /// session started with.
    pub async fn refresh(
        &self,
        plaintext: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Session, CoreError> {
        let result = self.rotate(plaintext, meta, now).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(CoreError::RotationConflict) => "conflict",
            Err(CoreError::InvalidOrExpired) => "invalid",
            Err(_) => "error",
        };
        metrics::counter!("ridepass_refresh_rotations_total", "outcome" => outcome).increment(1);

        let user_id = result.as_ref().ok().map(|s| s.access_claims.sub);
        audit::record(AuditEvent::Refresh, user_id, result.is_ok(), meta);
        result
    }

    async fn rotate(
        &self,
        plaintext: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Session, CoreError> {
        let current = self
            .refresh_tokens
            .find_by_hash(&hash_token(plaintext))
            .await?
            .ok_or(CoreError::InvalidOrExpired)?;

        let user = self
            .users
            .get_by_id(current.user_id)
            .await?
            .ok_or(CoreError::InvalidOrExpired)?;
        // Same outcome as a revoked or unknown token
        if !user.is_active {
            debug!("Refresh rejected for inactive user: {}", user.id);
            return Err(CoreError::InvalidOrExpired);
        }

        let refresh = self
            .refresh_tokens
            .rotate(current.id, user.id, meta, self.policy.refresh_ttl, now)
            .await
            .map_err(token_failure)?;
        let access = self.signer.mint_access_at(user.id, user.role, now)?;

        debug!("Rotated refresh token {} -> {}", current.id, refresh.record.id);
        Ok(Session {
            access_token: access.token,
            access_claims: access.claims,
            refresh,
        })
    }

    /// Revoke the presented refresh token; unknown or revoked tokens are fine
    pub async fn logout(
        &self,
        plaintext: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        match self
            .refresh_tokens
            .revoke_by_hash(&hash_token(plaintext), now)
            .await
        {
            Ok(()) | Err(DbError::NotFound(_)) => {
                audit::record(AuditEvent::Logout, None, true, meta);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke every live refresh token of a user, returning how many
    pub async fn logout_everywhere(
        &self,
        user_id: Uuid,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let revoked = self
            .refresh_tokens
            .revoke_all_for_user(user_id, now)
            .await?;
        info!("Revoked {} sessions for user: {}", revoked, user_id);
        audit::record(AuditEvent::LogoutEverywhere, Some(user_id), true, meta);
        Ok(revoked)
    }

    /// Redeem an email confirmation token
    ///
    /// Riders become active immediately. Drivers are only marked verified and
    /// stay inactive until an administrator approves them.
    pub async fn confirm_email(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<User, CoreError> {
        let result = self.redeem_confirmation(plaintext, purpose, now).await;

        let user_id = result.as_ref().ok().map(|u| u.id);
        audit::record(AuditEvent::ConfirmEmail, user_id, result.is_ok(), meta);
        result
    }

    async fn redeem_confirmation(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<User, CoreError> {
        if purpose == VerificationPurpose::PasswordReset {
            return Err(CoreError::InvalidOrExpired);
        }

        let token = self.consume(plaintext, purpose, now).await?;
        self.users
            .set_verified(token.user_id, true)
            .await
            .map_err(token_failure)?;
        if purpose == VerificationPurpose::RiderConfirm {
            self.users
                .set_active(token.user_id, true)
                .await
                .map_err(token_failure)?;
        }

        self.users
            .get_by_id(token.user_id)
            .await?
            .ok_or(CoreError::InvalidOrExpired)
    }

    async fn consume(
        &self,
        plaintext: &str,
        purpose: VerificationPurpose,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, CoreError> {
        let result = self
            .verification_tokens
            .validate_and_consume(plaintext, purpose, now)
            .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(DbError::InvalidToken) => "invalid",
            Err(_) => "error",
        };
        metrics::counter!(
            "ridepass_verification_consumed_total",
            "outcome" => outcome,
            "purpose" => purpose.as_str()
        )
        .increment(1);

        result.map_err(token_failure)
    }

    /// Issue a password reset token
    ///
    /// Returns `None` for unknown emails and admin accounts; callers must
    /// respond the same way in both cases.
    pub async fn request_password_reset(
        &self,
        email: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<Option<IssuedToken<VerificationToken>>, CoreError> {
        let user = match self.users.get_by_email(email).await? {
            Some(user) if !user.role.is_admin() => user,
            _ => {
                audit::record(AuditEvent::PasswordResetRequest, None, false, meta);
                return Ok(None);
            }
        };

        let token = self
            .verification_tokens
            .create(
                user.id,
                VerificationPurpose::PasswordReset,
                meta,
                self.policy.password_reset_ttl,
                now,
            )
            .await?;

        audit::record(AuditEvent::PasswordResetRequest, Some(user.id), true, meta);
        Ok(Some(token))
    }

    /// Redeem a reset token and replace the credential
    ///
    /// All refresh tokens and outstanding verification tokens of the user are
    /// revoked afterwards.
    pub async fn reset_password(
        &self,
        plaintext: &str,
        new_password: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        // Reject before consuming so a weak password does not burn the token
        validate_password(new_password)?;

        let token = match self
            .consume(plaintext, VerificationPurpose::PasswordReset, now)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                audit::record(AuditEvent::PasswordReset, None, false, meta);
                return Err(e);
            }
        };

        let password_hash = self.hasher.hash(new_password)?;
        self.users
            .update_password(token.user_id, &password_hash)
            .await
            .map_err(token_failure)?;

        let sessions = self
            .refresh_tokens
            .revoke_all_for_user(token.user_id, now)
            .await?;
        self.verification_tokens
            .revoke_all_for_user(token.user_id, now)
            .await?;

        info!(
            "Password reset for user {} ({} sessions revoked)",
            token.user_id, sessions
        );
        audit::record(AuditEvent::PasswordReset, Some(token.user_id), true, meta);
        Ok(())
    }

    /// Replace the credential of a signed-in user and end all their sessions
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
        meta: &ClientMeta,
        now: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        validate_password(new_password)?;

        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;
        if !self.hasher.verify(current_password, &user.password_hash) {
            audit::record(AuditEvent::PasswordChange, Some(user_id), false, meta);
            return Err(CoreError::InvalidCredentials);
        }

        let password_hash = self.hasher.hash(new_password)?;
        self.users.update_password(user_id, &password_hash).await?;
        let revoked = self
            .refresh_tokens
            .revoke_all_for_user(user_id, now)
            .await?;

        audit::record(AuditEvent::PasswordChange, Some(user_id), true, meta);
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ridepass_auth::SignerConfig;
    use ridepass_db::{InMemoryRefreshTokenStore, InMemoryUserStore, InMemoryVerificationTokenStore};

    const PASSWORD: &str = "correct horse battery";

    struct Harness {
        service: AuthService,
        users: InMemoryUserStore,
        refresh: InMemoryRefreshTokenStore,
        verification: InMemoryVerificationTokenStore,
    }

    fn cheap_hasher() -> PasswordHasher {
        PasswordHasher::with_params(1024, 1, 1).unwrap()
    }

    fn signer() -> Arc<TokenSigner> {
        Arc::new(
            TokenSigner::new(SignerConfig {
                issuer: "ridepass".to_string(),
                audience: "ridepass-clients".to_string(),
                access_secret: "access-secret-access-secret-0123456789".to_string(),
                refresh_secret: "refresh-secret-refresh-secret-0123456789".to_string(),
                access_ttl: Duration::minutes(15),
                refresh_ttl: Duration::days(7),
            })
            .unwrap(),
        )
    }

    fn harness_with(hasher: PasswordHasher) -> Harness {
        let users = InMemoryUserStore::new();
        let refresh = InMemoryRefreshTokenStore::new();
        let verification = InMemoryVerificationTokenStore::new();
        let service = AuthService::new(
            Arc::new(users.clone()),
            Arc::new(refresh.clone()),
            Arc::new(verification.clone()),
            signer(),
            hasher,
            AuthPolicy::default(),
        )
        .unwrap();
        Harness {
            service,
            users,
            refresh,
            verification,
        }
    }

    fn harness() -> Harness {
        harness_with(cheap_hasher())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn meta() -> ClientMeta {
        ClientMeta::new(Some("ridepass-test/1.0"), Some("203.0.113.7".parse().unwrap()))
    }

    async fn active_rider(h: &Harness, email: &str) -> User {
        let reg = h
            .service
            .register(email, PASSWORD, UserRole::Rider, &meta(), t0())
            .await
            .unwrap();
        h.service
            .confirm_email(
                &reg.confirmation.plaintext,
                VerificationPurpose::RiderConfirm,
                &meta(),
                t0(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rider_lifecycle() {
        let h = harness();
        let user = active_rider(&h, "Rider@Example.com").await;
        assert!(user.is_verified && user.is_active);
        assert_eq!(user.email, "rider@example.com");

        let session = h
            .service
            .login("rider@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();
        let claims = h
            .service
            .signer()
            .parse_access_at(&session.access_token, t0())
            .unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, UserRole::Rider);

        let later = t0() + Duration::minutes(10);
        let next = h
            .service
            .refresh(&session.refresh.plaintext, &meta(), later)
            .await
            .unwrap();
        assert_ne!(next.refresh.plaintext, session.refresh.plaintext);

        // Replaying the rotated token is rejected
        assert!(matches!(
            h.service
                .refresh(&session.refresh.plaintext, &meta(), later)
                .await,
            Err(CoreError::InvalidOrExpired)
        ));

        h.service
            .logout(&next.refresh.plaintext, &meta(), later)
            .await
            .unwrap();
        h.service
            .logout(&next.refresh.plaintext, &meta(), later)
            .await
            .unwrap();
        assert!(matches!(
            h.service.refresh(&next.refresh.plaintext, &meta(), later).await,
            Err(CoreError::InvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let h = harness();
        let long = "x".repeat(129);

        let cases = [
            ("not-an-email", PASSWORD, UserRole::Rider),
            ("a@example.com", "short", UserRole::Rider),
            ("a@example.com", long.as_str(), UserRole::Rider),
            ("a@example.com", PASSWORD, UserRole::Admin),
        ];
        for (email, password, role) in cases {
            assert!(matches!(
                h.service.register(email, password, role, &meta(), t0()).await,
                Err(CoreError::Validation(_))
            ));
        }

        h.service
            .register("dup@example.com", PASSWORD, UserRole::Rider, &meta(), t0())
            .await
            .unwrap();
        assert!(matches!(
            h.service
                .register(" DUP@example.com", PASSWORD, UserRole::Driver, &meta(), t0())
                .await,
            Err(CoreError::EmailAlreadyExists)
        ));
    }

    #[test]
    fn test_rejects_out_of_range_lifetimes() {
        let policies = [
            AuthPolicy {
                refresh_ttl: Duration::days(365 * 400_000),
                ..AuthPolicy::default()
            },
            AuthPolicy {
                password_reset_ttl: Duration::zero(),
                ..AuthPolicy::default()
            },
        ];
        for policy in policies {
            let result = AuthService::new(
                Arc::new(InMemoryUserStore::new()),
                Arc::new(InMemoryRefreshTokenStore::new()),
                Arc::new(InMemoryVerificationTokenStore::new()),
                signer(),
                cheap_hasher(),
                policy,
            );
            assert!(matches!(result, Err(CoreError::Auth(AuthError::Config(_)))));
        }
    }

    #[tokio::test]
    async fn test_login_failures() {
        let h = harness();
        h.service
            .register("pending@example.com", PASSWORD, UserRole::Rider, &meta(), t0())
            .await
            .unwrap();

        assert!(matches!(
            h.service
                .login("nobody@example.com", PASSWORD, &meta(), t0())
                .await,
            Err(CoreError::InvalidCredentials)
        ));
        assert!(matches!(
            h.service
                .login("pending@example.com", "wrong password", &meta(), t0())
                .await,
            Err(CoreError::InvalidCredentials)
        ));
        assert!(matches!(
            h.service
                .login("pending@example.com", PASSWORD, &meta(), t0())
                .await,
            Err(CoreError::AccountInactive)
        ));
    }

    #[tokio::test]
    async fn test_driver_confirmation_keeps_account_inactive() {
        let h = harness();
        let reg = h
            .service
            .register("driver@example.com", PASSWORD, UserRole::Driver, &meta(), t0())
            .await
            .unwrap();
        assert_eq!(
            reg.confirmation.record.purpose,
            VerificationPurpose::DriverConfirm
        );

        // Wrong purpose fails without consuming the token
        assert!(matches!(
            h.service
                .confirm_email(
                    &reg.confirmation.plaintext,
                    VerificationPurpose::RiderConfirm,
                    &meta(),
                    t0()
                )
                .await,
            Err(CoreError::InvalidOrExpired)
        ));

        let user = h
            .service
            .confirm_email(
                &reg.confirmation.plaintext,
                VerificationPurpose::DriverConfirm,
                &meta(),
                t0(),
            )
            .await
            .unwrap();
        assert!(user.is_verified);
        assert!(!user.is_active);

        assert!(matches!(
            h.service
                .confirm_email(
                    &reg.confirmation.plaintext,
                    VerificationPurpose::DriverConfirm,
                    &meta(),
                    t0()
                )
                .await,
            Err(CoreError::InvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn test_reset_password_revokes_everything() {
        let h = harness();
        let user = active_rider(&h, "reset@example.com").await;
        let s1 = h
            .service
            .login("reset@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();
        let s2 = h
            .service
            .login("reset@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();

        let first = h
            .service
            .request_password_reset("reset@example.com", &meta(), t0())
            .await
            .unwrap()
            .unwrap();
        let second = h
            .service
            .request_password_reset("reset@example.com", &meta(), t0())
            .await
            .unwrap()
            .unwrap();

        // Weak password leaves the token usable
        assert!(matches!(
            h.service
                .reset_password(&first.plaintext, "short", &meta(), t0())
                .await,
            Err(CoreError::Validation(_))
        ));

        h.service
            .reset_password(&first.plaintext, "a brand new secret", &meta(), t0())
            .await
            .unwrap();

        for session in [&s1, &s2] {
            let row = RefreshTokenStore::find_by_hash(
                &h.refresh,
                &session.refresh.record.token_hash,
            )
            .await
            .unwrap()
            .unwrap();
            assert!(!row.is_live(t0()));
        }
        let other = VerificationTokenStore::find_by_hash(&h.verification, &second.record.token_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(other.used_at.is_some());

        assert!(matches!(
            h.service
                .reset_password(&first.plaintext, "another new secret", &meta(), t0())
                .await,
            Err(CoreError::InvalidOrExpired)
        ));
        assert!(matches!(
            h.service
                .login("reset@example.com", PASSWORD, &meta(), t0())
                .await,
            Err(CoreError::InvalidCredentials)
        ));
        let session = h
            .service
            .login("reset@example.com", "a brand new secret", &meta(), t0())
            .await
            .unwrap();
        assert_eq!(session.access_claims.sub, user.id);
    }

    #[tokio::test]
    async fn test_password_reset_not_issued_for_unknown_or_admin() {
        let h = harness();
        h.users
            .create_user(NewUser {
                email: "admin@example.com".to_string(),
                password_hash: cheap_hasher().hash(PASSWORD).unwrap(),
                role: UserRole::Admin,
                is_active: true,
            })
            .await
            .unwrap();

        for email in ["admin@example.com", "ghost@example.com"] {
            let issued = h
                .service
                .request_password_reset(email, &meta(), t0())
                .await
                .unwrap();
            assert!(issued.is_none());
        }
    }

    #[tokio::test]
    async fn test_change_password_ends_sessions() {
        let h = harness();
        let user = active_rider(&h, "change@example.com").await;
        let session = h
            .service
            .login("change@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();

        assert!(matches!(
            h.service
                .change_password(user.id, "not the password", "fresh password", &meta(), t0())
                .await,
            Err(CoreError::InvalidCredentials)
        ));

        let revoked = h
            .service
            .change_password(user.id, PASSWORD, "fresh password", &meta(), t0())
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(matches!(
            h.service
                .refresh(&session.refresh.plaintext, &meta(), t0())
                .await,
            Err(CoreError::InvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn test_logout_everywhere() {
        let h = harness();
        let user = active_rider(&h, "many@example.com").await;
        let mut sessions = Vec::new();
        for _ in 0..3 {
            sessions.push(
                h.service
                    .login("many@example.com", PASSWORD, &meta(), t0())
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(
            h.service
                .logout_everywhere(user.id, &meta(), t0())
                .await
                .unwrap(),
            3
        );
        for session in sessions {
            assert!(h
                .service
                .refresh(&session.refresh.plaintext, &meta(), t0())
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_refresh_failures_for_inactive_user_look_like_forgeries() {
        use axum::response::IntoResponse;

        let h = harness();
        let user = active_rider(&h, "suspended@example.com").await;
        let revoked = h
            .service
            .login("suspended@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();
        let live = h
            .service
            .login("suspended@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();
        h.service
            .logout(&revoked.refresh.plaintext, &meta(), t0())
            .await
            .unwrap();
        h.users.set_active(user.id, false).await.unwrap();

        let forged = h
            .service
            .refresh("deadbeef", &meta(), t0())
            .await
            .unwrap_err()
            .into_response();
        for plaintext in [&revoked.refresh.plaintext, &live.refresh.plaintext] {
            let err = h
                .service
                .refresh(plaintext, &meta(), t0())
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidOrExpired));

            let response = err.into_response();
            assert_eq!(response.status(), forged.status());
        }
    }

    #[tokio::test]
    async fn test_refresh_picks_up_role_change() {
        let h = harness();
        let user = active_rider(&h, "promoted@example.com").await;
        let session = h
            .service
            .login("promoted@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();

        h.users.set_role(user.id, UserRole::Driver).await.unwrap();
        let next = h
            .service
            .refresh(&session.refresh.plaintext, &meta(), t0())
            .await
            .unwrap();
        assert_eq!(next.access_claims.role, UserRole::Driver);
    }

    #[tokio::test]
    async fn test_login_upgrades_outdated_hash() {
        let h = harness_with(PasswordHasher::with_params(2048, 1, 1).unwrap());
        let user = h
            .users
            .create_user(NewUser {
                email: "legacy@example.com".to_string(),
                password_hash: cheap_hasher().hash(PASSWORD).unwrap(),
                role: UserRole::Rider,
                is_active: true,
            })
            .await
            .unwrap();

        h.service
            .login("legacy@example.com", PASSWORD, &meta(), t0())
            .await
            .unwrap();

        let stored = h.users.get_by_id(user.id).await.unwrap().unwrap();
        assert_ne!(stored.password_hash, user.password_hash);
        assert!(stored.password_hash.contains("m=2048,t=1,p=1"));
    }
}
