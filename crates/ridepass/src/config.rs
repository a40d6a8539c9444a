//! Configuration loading and management

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Access token lifetime from which role snapshots are considered stale
pub const STALE_ROLE_WARNING_SECS: u64 = 3600;
/// Upper bound for every configured lifetime and interval
pub const MAX_DURATION_SECS: u64 = ridepass_auth::MAX_TTL_DAYS as u64 * 86_400;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

/// Signing and token lifetime configuration
///
/// Secrets have no usable default; they must come from the file, the
/// command line or the environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub refresh_secret: String,
    #[serde(default = "default_access_ttl_secs")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_verification_ttl_secs")]
    pub verification_ttl_secs: u64,
    #[serde(default = "default_password_reset_ttl_secs")]
    pub password_reset_ttl_secs: u64,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("verification_ttl_secs", &self.verification_ttl_secs)
            .field("password_reset_ttl_secs", &self.password_reset_ttl_secs)
            .finish()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            access_secret: String::new(),
            refresh_secret: String::new(),
            access_ttl_secs: default_access_ttl_secs(),
            refresh_ttl_secs: default_refresh_ttl_secs(),
            verification_ttl_secs: default_verification_ttl_secs(),
            password_reset_ttl_secs: default_password_reset_ttl_secs(),
        }
    }
}

impl TokenConfig {
    pub fn access_ttl(&self) -> chrono::Duration {
        seconds(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        seconds(self.refresh_ttl_secs)
    }

    pub fn verification_ttl(&self) -> chrono::Duration {
        seconds(self.verification_ttl_secs)
    }

    pub fn password_reset_ttl(&self) -> chrono::Duration {
        seconds(self.password_reset_ttl_secs)
    }

    /// Whether access tokens live long enough for role claims to go stale
    pub fn has_stale_role_risk(&self) -> bool {
        self.access_ttl_secs >= STALE_ROLE_WARNING_SECS
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
    /// Only enable behind a proxy that overwrites X-Forwarded-For
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_limit_capacity(),
            window_secs: default_rate_limit_window_secs(),
            trust_forwarded_headers: false,
        }
    }
}

/// Request authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub cookie_fallback: bool,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_fallback: false,
            cookie_name: default_cookie_name(),
        }
    }
}

/// Expired token cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "./data/ridepass.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_operation_timeout_secs() -> u64 {
    5
}

fn default_issuer() -> String {
    "ridepass".to_string()
}

fn default_audience() -> String {
    "ridepass-clients".to_string()
}

fn default_access_ttl_secs() -> u64 {
    15 * 60
}

fn default_refresh_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_verification_ttl_secs() -> u64 {
    30 * 60
}

fn default_password_reset_ttl_secs() -> u64 {
    15 * 60
}

fn default_rate_limit_capacity() -> u32 {
    60
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_cookie_name() -> String {
    "access_token".to_string()
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        // Check if config file exists
        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Reject values that would only fail later at runtime
    ///
    /// Secrets are checked by the token signer itself.
    pub fn validate(&self) -> Result<()> {
        let ttls = [
            ("tokens.access_ttl_secs", self.tokens.access_ttl_secs),
            ("tokens.refresh_ttl_secs", self.tokens.refresh_ttl_secs),
            ("tokens.verification_ttl_secs", self.tokens.verification_ttl_secs),
            ("tokens.password_reset_ttl_secs", self.tokens.password_reset_ttl_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
            ("database.operation_timeout_secs", self.database.operation_timeout_secs),
        ];
        for (name, value) in ttls {
            if value == 0 {
                bail!("{} must be positive", name);
            }
            if value > MAX_DURATION_SECS {
                bail!("{} must not exceed {}", name, MAX_DURATION_SECS);
            }
        }
        if self.rate_limit_window() > ridepass_auth::MAX_WINDOW {
            bail!(
                "rate_limit.window_secs must not exceed {}",
                ridepass_auth::MAX_WINDOW.as_secs()
            );
        }

        if self.rate_limit.capacity == 0 {
            bail!("rate_limit.capacity must be positive");
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be positive");
        }
        if self.auth.cookie_fallback && self.auth.cookie_name.trim().is_empty() {
            bail!("auth.cookie_name must be set when cookie_fallback is enabled");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            bail!("logging.format must be \"pretty\" or \"json\"");
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.database.path)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.database.operation_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }
}
