//! Authentication error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Invalid construction parameters; fatal at startup
    #[error("Invalid auth configuration: {0}")]
    Config(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Unknown signing key id: {0}")]
    UnknownKeyId(String),

    #[error("Missing authorization header")]
    MissingAuthHeader,

    #[error("Invalid authorization header format")]
    InvalidAuthHeader,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Too many requests")]
    RateLimited,

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    /// Failure while minting a token; a server fault, never the client's
    #[error("Token signing error: {0}")]
    Signing(String),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "Invalid credentials"),
            AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::UnknownKeyId(_)
            | AuthError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::MissingAuthHeader => {
                (StatusCode::UNAUTHORIZED, "Missing authorization header")
            }
            AuthError::InvalidAuthHeader => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            ),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too many requests"),
            AuthError::Config(_) | AuthError::PasswordHash(_) | AuthError::Signing(_) => {
                error!("Internal auth failure: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        };

        let body = axum::Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
