//! Core error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ridepass_auth::AuthError;
use ridepass_db::DbError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account inactive")]
    AccountInactive,

    #[error("Email already registered")]
    EmailAlreadyExists,

    /// Every verification, reset and refresh failure collapses into this
    #[error("Invalid or expired token")]
    InvalidOrExpired,

    /// Lost a concurrent rotation; the client must log in again
    #[error("Refresh token rotation conflict")]
    RotationConflict,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            CoreError::Auth(e) => return e.into_response(),
            CoreError::Database(e) if e.is_internal() => {
                error!("Database failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
            CoreError::Database(DbError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "Not found".to_string())
            }
            CoreError::Database(DbError::Duplicate(_)) => {
                (StatusCode::CONFLICT, "Duplicate entry".to_string())
            }
            CoreError::Database(_) | CoreError::InvalidOrExpired | CoreError::RotationConflict => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token".to_string())
            }
            CoreError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid credentials".to_string())
            }
            CoreError::AccountInactive => (StatusCode::FORBIDDEN, "Account inactive".to_string()),
            CoreError::EmailAlreadyExists => {
                (StatusCode::CONFLICT, "Email already registered".to_string())
            }
            CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = axum::Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
