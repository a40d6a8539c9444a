//! Signed access and refresh-carrier tokens
//!
//! Both token kinds are HS256 JWTs with their own secret and a `kid` header
//! naming that secret's version. A token is only checked against the key its
//! `kid` names; an unrecognised `kid` is rejected outright, which keeps
//! secret rotation safe.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use ridepass_db::UserRole;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;

/// Key id of the current access-token secret
pub const ACCESS_KEY_ID: &str = "hs256:access:v1";
/// Key id of the current refresh-carrier secret
pub const REFRESH_KEY_ID: &str = "hs256:refresh:v1";
/// Allowed clock skew on `exp` and `nbf`
pub const CLOCK_SKEW_LEEWAY_SECS: i64 = 30;
pub const MIN_SECRET_LEN: usize = 32;
/// Longest accepted token lifetime, in days
pub const MAX_TTL_DAYS: i64 = 3650;

/// Claims of a short-lived access token
///
/// `role` is a snapshot taken at mint time. A role change only takes effect
/// once outstanding access tokens expire, so access TTLs should stay in the
/// range of minutes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    pub role: UserRole,
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Unique token id
    pub jti: Uuid,
}

/// Claims of a refresh carrier token
///
/// A carrier only proves possession; the refresh ledger decides liveness.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: Uuid,
}

trait TimedClaims {
    fn nbf(&self) -> i64;
    fn exp(&self) -> i64;
}

impl TimedClaims for AccessClaims {
    fn nbf(&self) -> i64 {
        self.nbf
    }
    fn exp(&self) -> i64 {
        self.exp
    }
}

impl TimedClaims for RefreshClaims {
    fn nbf(&self) -> i64 {
        self.nbf
    }
    fn exp(&self) -> i64 {
        self.exp
    }
}

/// A freshly signed token and the claims it carries
#[derive(Debug, Clone)]
pub struct MintedToken<C> {
    pub token: String,
    pub claims: C,
}

/// Construction parameters for [`TokenSigner`]
#[derive(Clone)]
pub struct SignerConfig {
    pub issuer: String,
    pub audience: String,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

struct SigningKey {
    kid: &'static str,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    fn new(kid: &'static str, secret: &str) -> Self {
        Self {
            kid,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Mints and parses access tokens and refresh carriers
pub struct TokenSigner {
    issuer: String,
    audience: String,
    access: SigningKey,
    refresh: SigningKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    /// Validate `config` and build a signer
    ///
    /// Fails on an empty issuer or audience, a secret shorter than 32 bytes,
    /// identical secrets, or a TTL that is non-positive or longer than
    /// [`MAX_TTL_DAYS`].
    pub fn new(config: SignerConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError::Config("issuer must not be empty".into()));
        }
        if config.audience.trim().is_empty() {
            return Err(AuthError::Config("audience must not be empty".into()));
        }
        if config.access_secret.len() < MIN_SECRET_LEN
            || config.refresh_secret.len() < MIN_SECRET_LEN
        {
            return Err(AuthError::Config(format!(
                "signing secrets must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if config.access_secret == config.refresh_secret {
            return Err(AuthError::Config(
                "access and refresh secrets must differ".into(),
            ));
        }
        if config.access_ttl <= Duration::zero() || config.refresh_ttl <= Duration::zero() {
            return Err(AuthError::Config("token TTLs must be positive".into()));
        }
        let max_ttl = Duration::days(MAX_TTL_DAYS);
        if config.access_ttl > max_ttl || config.refresh_ttl > max_ttl {
            return Err(AuthError::Config(format!(
                "token TTLs must not exceed {} days",
                MAX_TTL_DAYS
            )));
        }

        Ok(Self {
            access: SigningKey::new(ACCESS_KEY_ID, &config.access_secret),
            refresh: SigningKey::new(REFRESH_KEY_ID, &config.refresh_secret),
            issuer: config.issuer,
            audience: config.audience,
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Mint an access token for a user
    pub fn mint_access(
        &self,
        user_id: Uuid,
        role: UserRole,
    ) -> Result<MintedToken<AccessClaims>, AuthError> {
        self.mint_access_at(user_id, role, Utc::now())
    }

    pub fn mint_access_at(
        &self,
        user_id: Uuid,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Result<MintedToken<AccessClaims>, AuthError> {
        let claims = AccessClaims {
            sub: user_id,
            role,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expiry(now, self.access_ttl)?,
            jti: Uuid::new_v4(),
        };

        debug!("Minting access token for user: {}", user_id);
        let token = sign(&self.access, &claims)?;
        Ok(MintedToken { token, claims })
    }

    /// Parse and validate an access token
    pub fn parse_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.parse_access_at(token, Utc::now())
    }

    pub fn parse_access_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, AuthError> {
        self.verify(&self.access, token, now)
    }

    /// Mint a refresh carrier token
    pub fn mint_refresh(&self, user_id: Uuid) -> Result<MintedToken<RefreshClaims>, AuthError> {
        self.mint_refresh_at(user_id, Utc::now())
    }

    pub fn mint_refresh_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MintedToken<RefreshClaims>, AuthError> {
        let claims = RefreshClaims {
            sub: user_id,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expiry(now, self.refresh_ttl)?,
            jti: Uuid::new_v4(),
        };

        let token = sign(&self.refresh, &claims)?;
        Ok(MintedToken { token, claims })
    }

    /// Parse and validate a refresh carrier token
    pub fn parse_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        self.parse_refresh_at(token, Utc::now())
    }

    pub fn parse_refresh_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshClaims, AuthError> {
        self.verify(&self.refresh, token, now)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);
        // Time claims are checked against the caller's clock below.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation
    }

    fn verify<C>(&self, key: &SigningKey, token: &str, now: DateTime<Utc>) -> Result<C, AuthError>
    where
        C: DeserializeOwned + TimedClaims,
    {
        let header = decode_header(token)?;
        match header.kid.as_deref() {
            Some(kid) if kid == key.kid => {}
            other => {
                let kid = other.unwrap_or("<none>").to_string();
                debug!("Rejecting token with key id {}", kid);
                return Err(AuthError::UnknownKeyId(kid));
            }
        }

        let claims = decode::<C>(token, &key.decoding, &self.validation())?.claims;

        let now = now.timestamp();
        if claims.exp() < now - CLOCK_SKEW_LEEWAY_SECS {
            return Err(AuthError::TokenExpired);
        }
        if claims.nbf() > now + CLOCK_SKEW_LEEWAY_SECS {
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<i64, AuthError> {
    now.checked_add_signed(ttl)
        .map(|exp| exp.timestamp())
        .ok_or_else(|| AuthError::Signing("expiry out of range".into()))
}

fn sign<C: Serialize>(key: &SigningKey, claims: &C) -> Result<String, AuthError> {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(key.kid.to_string());
    encode(&header, claims, &key.encoding).map_err(|e| AuthError::Signing(e.to_string()))
}
