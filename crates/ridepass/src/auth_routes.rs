//! Authentication endpoints
//!
//! Thin wrappers over [`AuthService`]: each handler extracts its input, calls
//! one flow and renders the result. Every failure is a [`CoreError`], so the
//! status mapping lives in one place.

use axum::{
    Extension, Json, Router,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{StatusCode, header::USER_AGENT, request::Parts},
    middleware,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use ridepass_auth::{AuthState, AuthUser, auth_middleware, client_ip};
use ridepass_core::{AuthService, CoreError, Session};
use ridepass_db::{
    ClientMeta, IssuedToken, UserRole, VerificationPurpose, VerificationToken, hash_token,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// A verification token ready to be mailed
#[derive(Debug, Clone)]
pub struct OutboundToken {
    pub email: String,
    pub purpose: VerificationPurpose,
    pub plaintext: String,
    pub expires_at: DateTime<Utc>,
}

impl OutboundToken {
    fn new(email: &str, issued: IssuedToken<VerificationToken>) -> Self {
        Self {
            email: email.to_string(),
            purpose: issued.record.purpose,
            plaintext: issued.plaintext,
            expires_at: issued.record.expires_at,
        }
    }
}

/// Hands verification tokens to whatever delivers mail
pub trait TokenOutbox: Send + Sync {
    fn deliver(&self, token: OutboundToken);
}

/// Outbox that only records the delivery in the log
///
/// The plaintext never reaches the log; the stored hash identifies the
/// ledger row instead.
pub struct LogOutbox;

impl TokenOutbox for LogOutbox {
    fn deliver(&self, token: OutboundToken) {
        info!(
            target: "outbox",
            email = %token.email,
            purpose = token.purpose.as_str(),
            token_hash = %hash_token(&token.plaintext),
            expires_at = %token.expires_at,
            "Verification token ready for delivery"
        );
    }
}

/// State shared by the auth endpoints
#[derive(Clone)]
pub struct AuthApiState {
    pub service: Arc<AuthService>,
    pub outbox: Arc<dyn TokenOutbox>,
    pub trust_forwarded_headers: bool,
}

/// Request metadata recorded on issued tokens and audit events
pub struct Client(pub ClientMeta);

impl FromRequestParts<AuthApiState> for Client {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthApiState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = client_ip(&parts.headers, peer, state.trust_forwarded_headers);
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok());
        Ok(Client(ClientMeta::new(user_agent, ip)))
    }
}

// ==================== Request / Response Types ====================

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub token: String,
    pub purpose: VerificationPurpose,
}

#[derive(Deserialize)]
pub struct ForgotRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub token: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: &'static str,
    /// Access token expiry (Unix timestamp)
    pub expires_at: i64,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            access_token: session.access_token,
            token_type: "Bearer",
            expires_at: session.access_claims.exp,
            refresh_token: session.refresh.plaintext,
            refresh_expires_at: session.refresh.record.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RevokedResponse {
    pub revoked: u64,
}

const FORGOT_RESPONSE: &str = "If the email exists, a reset link has been sent";

fn message(message: &'static str) -> Json<MessageResponse> {
    Json(MessageResponse { message })
}

// ==================== Handlers ====================

async fn register(
    state: &AuthApiState,
    meta: &ClientMeta,
    request: CredentialsRequest,
    role: UserRole,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    let registration = state
        .service
        .register(&request.email, &request.password, role, meta, Utc::now())
        .await?;
    state.outbox.deliver(OutboundToken::new(
        &registration.user.email,
        registration.confirmation,
    ));

    Ok((
        StatusCode::CREATED,
        message("Registration received. Check your email to confirm."),
    ))
}

/// POST /auth/register/rider
async fn register_rider(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    register(&state, &meta, request, UserRole::Rider).await
}

/// POST /auth/register/driver
async fn register_driver(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    register(&state, &meta, request, UserRole::Driver).await
}

/// POST /auth/login
async fn login(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<CredentialsRequest>,
) -> Result<Json<SessionResponse>, CoreError> {
    let session = state
        .service
        .login(&request.email, &request.password, &meta, Utc::now())
        .await?;
    Ok(Json(session.into()))
}

/// POST /auth/refresh
async fn refresh(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<SessionResponse>, CoreError> {
    let session = state
        .service
        .refresh(&request.refresh_token, &meta, Utc::now())
        .await?;
    Ok(Json(session.into()))
}

/// POST /auth/logout
async fn logout(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<RefreshRequest>,
) -> Result<StatusCode, CoreError> {
    state
        .service
        .logout(&request.refresh_token, &meta, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/verify?token=..&purpose=..
async fn verify(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<MessageResponse>, CoreError> {
    let user = state
        .service
        .confirm_email(&query.token, query.purpose, &meta, Utc::now())
        .await?;

    Ok(if user.is_active {
        message("Email verified. Your account is now active.")
    } else {
        message("Email verified. Your account is pending review.")
    })
}

/// POST /auth/forgot
///
/// Answers the same way whether or not a token was issued.
async fn forgot(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<ForgotRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    if let Some(issued) = state
        .service
        .request_password_reset(&request.email, &meta, Utc::now())
        .await?
    {
        state.outbox.deliver(OutboundToken::new(
            &ridepass_db::normalize_email(&request.email),
            issued,
        ));
    } else {
        debug!("No reset token issued");
    }

    Ok((StatusCode::ACCEPTED, message(FORGOT_RESPONSE)))
}

/// POST /auth/reset
async fn reset(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Json(request): Json<ResetRequest>,
) -> Result<Json<MessageResponse>, CoreError> {
    state
        .service
        .reset_password(&request.token, &request.password, &meta, Utc::now())
        .await?;
    Ok(message("Password updated. Sign in again on every device."))
}

/// POST /auth/logout-all
async fn logout_all(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<RevokedResponse>, CoreError> {
    let revoked = state
        .service
        .logout_everywhere(user.id, &meta, Utc::now())
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

/// POST /auth/password
async fn change_password(
    State(state): State<AuthApiState>,
    Client(meta): Client,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<RevokedResponse>, CoreError> {
    let revoked = state
        .service
        .change_password(
            user.id,
            &request.current_password,
            &request.new_password,
            &meta,
            Utc::now(),
        )
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

/// Create auth routes
pub fn routes(state: AuthApiState, auth: AuthState) -> Router {
    let public = Router::new()
        .route("/auth/register/rider", post(register_rider))
        .route("/auth/register/driver", post(register_driver))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/verify", get(verify))
        .route("/auth/forgot", post(forgot))
        .route("/auth/reset", post(reset));

    let protected = Router::new()
        .route("/auth/logout-all", post(logout_all))
        .route("/auth/password", post(change_password))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    public.merge(protected).with_state(state)
}
