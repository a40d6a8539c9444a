//! Ridepass - credential and session token service

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use ridepass_auth::{
    AuthSettings, AuthState, PasswordHasher, RateLimitState, RateLimiter, SignerConfig,
    TokenSigner,
};
use ridepass_core::{AuthPolicy, AuthService, CleanupSweeper};
use ridepass_db::{Database, DatabaseOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod auth_routes;
mod config;
mod routes;

use auth_routes::{AuthApiState, LogOutbox};
use config::Config;
use routes::create_router;

/// Ridepass - credential and session token service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "RIDEPASS_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "RIDEPASS_PORT")]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long, env = "RIDEPASS_DATABASE")]
    database: Option<String>,

    /// Access token signing secret
    #[arg(long, env = "RIDEPASS_ACCESS_SECRET", hide_env_values = true)]
    access_secret: Option<String>,

    /// Refresh carrier signing secret
    #[arg(long, env = "RIDEPASS_REFRESH_SECRET", hide_env_values = true)]
    refresh_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(&args.config)?;
    if let Some(path) = args.database {
        config.database.path = path;
    }
    if let Some(secret) = args.access_secret {
        config.tokens.access_secret = secret;
    }
    if let Some(secret) = args.refresh_secret {
        config.tokens.refresh_secret = secret;
    }
    config.validate()?;

    // Initialize logging
    init_logging(&config.logging.level, &config.logging.format);

    info!("Starting Ridepass v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Initialize database
    if let Some(parent) = std::path::Path::new(&config.database.path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Arc::new(
        Database::connect(
            &config.database_url(),
            DatabaseOptions {
                max_connections: config.database.max_connections,
                operation_timeout: config.operation_timeout(),
                ..DatabaseOptions::default()
            },
        )
        .await?,
    );

    // Signing configuration problems are fatal
    let signer = Arc::new(
        TokenSigner::new(SignerConfig {
            issuer: config.tokens.issuer.clone(),
            audience: config.tokens.audience.clone(),
            access_secret: config.tokens.access_secret.clone(),
            refresh_secret: config.tokens.refresh_secret.clone(),
            access_ttl: config.tokens.access_ttl(),
            refresh_ttl: config.tokens.refresh_ttl(),
        })
        .context("Invalid token configuration")?,
    );
    if config.tokens.has_stale_role_risk() {
        warn!(
            "Access token TTL is {}s; role changes take that long to reach outstanding tokens",
            config.tokens.access_ttl_secs
        );
    }

    let service = Arc::new(AuthService::new(
        db.clone(),
        db.clone(),
        db.clone(),
        signer.clone(),
        PasswordHasher::new(),
        AuthPolicy {
            refresh_ttl: config.tokens.refresh_ttl(),
            verification_ttl: config.tokens.verification_ttl(),
            password_reset_ttl: config.tokens.password_reset_ttl(),
        },
    )?);

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.capacity,
        config.rate_limit_window(),
    )?);

    // Background tasks
    let cancel = CancellationToken::new();
    let sweeper = Arc::new(CleanupSweeper::new(
        db.clone(),
        db.clone(),
        config.cleanup_interval(),
    ));
    let background = vec![
        sweeper.spawn(cancel.clone()),
        limiter.clone().spawn_sweeper(cancel.clone()),
    ];

    // Create router
    let app = create_router(
        AuthState {
            signer,
            settings: AuthSettings {
                cookie_fallback: config.auth.cookie_fallback,
                cookie_name: config.auth.cookie_name.clone(),
            },
        },
        AuthApiState {
            service,
            outbox: Arc::new(LogOutbox),
            trust_forwarded_headers: config.rate_limit.trust_forwarded_headers,
        },
        RateLimitState {
            limiter,
            trust_forwarded_headers: config.rate_limit.trust_forwarded_headers,
        },
        Some(Arc::new(metrics_handle)),
    );

    // Determine bind address
    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
