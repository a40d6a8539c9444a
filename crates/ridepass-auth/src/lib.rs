//! Ridepass Authentication and Authorization
//!
//! Credential hashing, signed access tokens, per-client rate limiting and the
//! Axum middleware that enforces them.

pub mod error;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod rate_limit;

pub use error::AuthError;
pub use jwt::{
    ACCESS_KEY_ID, AccessClaims, MAX_TTL_DAYS, MintedToken, REFRESH_KEY_ID, RefreshClaims,
    SignerConfig, TokenSigner,
};
pub use middleware::{
    AuthSettings, AuthState, AuthUser, RoleGuard, auth_middleware, require_admin, require_role,
};
pub use password::{PasswordHasher, hash_password, verify_password};
pub use rate_limit::{
    MAX_WINDOW, RateLimitState, RateLimiter, client_ip, rate_limit_middleware,
};
