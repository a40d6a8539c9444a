//! HTTP surface of the service

use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use ridepass_auth::{AuthState, AuthUser, RateLimitState, auth_middleware, rate_limit_middleware};
use ridepass_db::UserRole;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth_routes::{self, AuthApiState};

pub type MetricsHandle = PrometheusHandle;

/// Health status response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Identity carried by the presented access token
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user_id: Uuid,
    pub role: UserRole,
    pub expires_at: i64,
}

/// Health check handler
async fn health() -> Json<HealthResponse> {
    metrics::counter!("ridepass_health_checks_total").increment(1);

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn get_metrics(State(handle): State<Arc<MetricsHandle>>) -> impl IntoResponse {
    handle.render()
}

/// GET /session - who the bearer is
async fn session(Extension(user): Extension<AuthUser>) -> Json<SessionResponse> {
    Json(SessionResponse {
        user_id: user.id,
        role: user.role,
        expires_at: user.expires_at,
    })
}

/// Build the application router
///
/// The rate limiter runs ahead of everything else, including health checks.
pub fn create_router(
    auth: AuthState,
    api: AuthApiState,
    rate_limit: RateLimitState,
    metrics_handle: Option<Arc<MetricsHandle>>,
) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .merge(auth_routes::routes(api, auth.clone()))
        .merge(
            Router::new()
                .route("/session", get(session))
                .route_layer(middleware::from_fn_with_state(auth, auth_middleware)),
        );

    if let Some(handle) = metrics_handle {
        router = router.merge(
            Router::new()
                .route("/metrics", get(get_metrics))
                .with_state(handle),
        );
    }

    router
        .layer(middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_routes::{OutboundToken, TokenOutbox};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use chrono::Duration;
    use parking_lot::Mutex;
    use ridepass_auth::{AuthSettings, PasswordHasher, RateLimiter, SignerConfig, TokenSigner};
    use ridepass_core::{AuthPolicy, AuthService};
    use ridepass_db::{
        InMemoryRefreshTokenStore, InMemoryUserStore, InMemoryVerificationTokenStore,
        VerificationPurpose,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Keeps every delivered token so tests can play the mail recipient
    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<OutboundToken>>,
    }

    impl RecordingOutbox {
        fn last(&self) -> Option<OutboundToken> {
            self.sent.lock().last().cloned()
        }

        fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl TokenOutbox for RecordingOutbox {
        fn deliver(&self, token: OutboundToken) {
            self.sent.lock().push(token);
        }
    }

    struct TestApp {
        router: Router,
        signer: Arc<TokenSigner>,
        outbox: Arc<RecordingOutbox>,
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

    fn app(capacity: u32) -> TestApp {
        let signer = signer();
        let service = AuthService::new(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemoryRefreshTokenStore::new()),
            Arc::new(InMemoryVerificationTokenStore::new()),
            signer.clone(),
            PasswordHasher::with_params(1024, 1, 1).unwrap(),
            AuthPolicy::default(),
        )
        .unwrap();
        let outbox = Arc::new(RecordingOutbox::default());
        let limiter =
            RateLimiter::new(capacity, std::time::Duration::from_secs(60)).unwrap();

        let router = create_router(
            AuthState {
                signer: signer.clone(),
                settings: AuthSettings::default(),
            },
            AuthApiState {
                service: Arc::new(service),
                outbox: outbox.clone(),
                trust_forwarded_headers: false,
            },
            RateLimitState {
                limiter: Arc::new(limiter),
                trust_forwarded_headers: false,
            },
            None,
        );
        TestApp {
            router,
            signer,
            outbox,
        }
    }

    fn request(uri: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("user-agent", "ridepass-test/1.0");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    const PASSWORD: &str = "correct horse battery";

    /// Register and confirm a rider, returning its login response body
    async fn signed_in_rider(app: &TestApp, email: &str) -> Value {
        let credentials = json!({ "email": email, "password": PASSWORD });
        let response = send(&app.router, post("/auth/register/rider", None, credentials.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let token = app.outbox.last().unwrap();
        assert_eq!(token.purpose, VerificationPurpose::RiderConfirm);
        let uri = format!("/auth/verify?token={}&purpose=rider_confirm", token.plaintext);
        let response = send(&app.router, request(&uri, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app.router, post("/auth/login", None, credentials)).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(10);
        let response = send(&app.router, request("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_requires_token() {
        let app = app(10);

        let response = send(&app.router, request("/session", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let user = Uuid::new_v4();
        let minted = app.signer.mint_access(user, UserRole::Driver).unwrap();
        let response = send(&app.router, request("/session", Some(&minted.token))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["user_id"], user.to_string());
        assert_eq!(json["role"], "driver");
        assert_eq!(json["expires_at"], minted.claims.exp);
    }

    #[tokio::test]
    async fn test_rate_limit_covers_every_route() {
        let app = app(2);

        for _ in 0..2 {
            let response = send(&app.router, request("/health", None)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = send(
            &app.router,
            post("/auth/login", None, json!({ "email": "a@example.com", "password": PASSWORD })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rider_session_over_http() {
        let app = app(100);
        let session = signed_in_rider(&app, "rider@example.com").await;
        assert_eq!(session["token_type"], "Bearer");

        let access = session["access_token"].as_str().unwrap();
        let response = send(&app.router, request("/session", Some(access))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["role"], "rider");

        // Rotation hands out a new refresh token and retires the old one
        let old_refresh = session["refresh_token"].as_str().unwrap();
        let response = send(
            &app.router,
            post("/auth/refresh", None, json!({ "refresh_token": old_refresh })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let rotated = body_json(response).await;
        assert_ne!(rotated["refresh_token"], session["refresh_token"]);

        let response = send(
            &app.router,
            post("/auth/refresh", None, json!({ "refresh_token": old_refresh })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Invalid or expired token");

        let response = send(&app.router, post("/auth/logout-all", Some(access), json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["revoked"], 1);

        let response = send(
            &app.router,
            post("/auth/refresh", None, json!({ "refresh_token": rotated["refresh_token"] })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_all_requires_token() {
        let app = app(10);
        let response = send(&app.router, post("/auth/logout-all", None, json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_driver_confirmation_leaves_account_pending() {
        let app = app(100);
        let credentials = json!({ "email": "driver@example.com", "password": PASSWORD });
        let response = send(&app.router, post("/auth/register/driver", None, credentials.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let token = app.outbox.last().unwrap();
        assert_eq!(token.purpose, VerificationPurpose::DriverConfirm);

        // A driver token does not redeem as a rider confirmation
        let uri = format!("/auth/verify?token={}&purpose=rider_confirm", token.plaintext);
        let response = send(&app.router, request(&uri, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let uri = format!("/auth/verify?token={}&purpose=driver_confirm", token.plaintext);
        let response = send(&app.router, request(&uri, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app.router, post("/auth/login", None, credentials)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let app = app(100);
        let credentials = json!({ "email": "dup@example.com", "password": PASSWORD });
        let response = send(&app.router, post("/auth/register/rider", None, credentials.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&app.router, post("/auth/register/driver", None, credentials)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(app.outbox.count(), 1);
    }

    #[tokio::test]
    async fn test_forgot_and_reset_password() {
        let app = app(100);
        let session = signed_in_rider(&app, "forgetful@example.com").await;
        let sent_before = app.outbox.count();

        // Unknown and known emails get the same answer
        let unknown = send(
            &app.router,
            post("/auth/forgot", None, json!({ "email": "nobody@example.com" })),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::ACCEPTED);
        let unknown = body_json(unknown).await;
        assert_eq!(app.outbox.count(), sent_before);

        let known = send(
            &app.router,
            post("/auth/forgot", None, json!({ "email": "Forgetful@Example.com" })),
        )
        .await;
        assert_eq!(known.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(known).await, unknown);

        let token = app.outbox.last().unwrap();
        assert_eq!(token.purpose, VerificationPurpose::PasswordReset);
        assert_eq!(token.email, "forgetful@example.com");

        let new_password = "a brand new passphrase";
        let response = send(
            &app.router,
            post(
                "/auth/reset",
                None,
                json!({ "token": token.plaintext, "password": new_password }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Reset revokes existing sessions and the token is single-use
        let response = send(
            &app.router,
            post("/auth/refresh", None, json!({ "refresh_token": session["refresh_token"] })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = send(
            &app.router,
            post(
                "/auth/reset",
                None,
                json!({ "token": token.plaintext, "password": "yet another passphrase" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            &app.router,
            post(
                "/auth/login",
                None,
                json!({ "email": "forgetful@example.com", "password": new_password }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_change_password_and_logout() {
        let app = app(100);
        let session = signed_in_rider(&app, "changer@example.com").await;
        let access = session["access_token"].as_str().unwrap();

        let response = send(
            &app.router,
            post(
                "/auth/password",
                Some(access),
                json!({ "current_password": "not my password", "new_password": "whatever works now" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            &app.router,
            post(
                "/auth/password",
                Some(access),
                json!({ "current_password": PASSWORD, "new_password": "whatever works now" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Logout is idempotent even for a token the change already revoked
        for _ in 0..2 {
            let response = send(
                &app.router,
                post("/auth/logout", None, json!({ "refresh_token": session["refresh_token"] })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
    }
}
