//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, COOKIE},
    },
    middleware::Next,
    response::Response,
};
use ridepass_db::UserRole;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;
use crate::jwt::{AccessClaims, TokenSigner};

/// Where the middleware may look for an access token
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Accept the token from a cookie when no Authorization header is sent.
    /// Widens CSRF exposure; off unless explicitly enabled.
    pub cookie_fallback: bool,
    pub cookie_name: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            cookie_fallback: false,
            cookie_name: "access_token".to_string(),
        }
    }
}

/// Shared state for [`auth_middleware`]
#[derive(Clone)]
pub struct AuthState {
    pub signer: Arc<TokenSigner>,
    pub settings: AuthSettings,
}

/// Authenticated user information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: UserRole,
    pub token_id: Uuid,
    /// Access token expiry (Unix timestamp)
    pub expires_at: i64,
}

impl AuthUser {
    /// Create from JWT claims
    pub fn from_claims(claims: &AccessClaims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
            token_id: claims.jti,
            expires_at: claims.exp,
        }
    }
}

/// Extract bearer token from authorization header
///
/// The scheme is matched case-insensitively.
pub fn extract_bearer_token(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header
        .split_once(' ')
        .ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn find_token<'a>(headers: &'a HeaderMap, settings: &AuthSettings) -> Result<&'a str, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let header = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return extract_bearer_token(header);
    }

    if settings.cookie_fallback
        && let Some(token) = cookie_value(headers, &settings.cookie_name)
    {
        return Ok(token);
    }

    Err(AuthError::MissingAuthHeader)
}

/// Authentication middleware
///
/// Validates the access token and adds the [`AuthUser`] to request extensions.
/// Requests without a valid token are rejected.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = find_token(request.headers(), &state.settings)?;
    let claims = state.signer.parse_access(token)?;
    let user = AuthUser::from_claims(&claims);

    debug!("Authenticated user: {} ({})", user.id, user.role.as_str());

    // Add user to request extensions
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// Roles allowed through [`require_role`]
#[derive(Debug, Clone)]
pub struct RoleGuard(pub Arc<[UserRole]>);

impl RoleGuard {
    pub fn new(roles: &[UserRole]) -> Self {
        Self(roles.into())
    }
}

/// Middleware to require one of a set of roles
pub async fn require_role(
    State(guard): State<RoleGuard>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingAuthHeader)?;

    if !guard.0.contains(&user.role) {
        return Err(AuthError::InsufficientPermissions);
    }

    Ok(next.run(request).await)
}

/// Middleware to require admin role
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingAuthHeader)?;

    if !user.role.is_admin() {
        return Err(AuthError::InsufficientPermissions);
    }

    Ok(next.run(request).await)
}
