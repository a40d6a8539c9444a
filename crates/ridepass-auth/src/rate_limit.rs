//! Per-key fixed-window rate limiting
//!
//! The key map sits behind a read/write lock that is only written when a
//! bucket is created or reaped; each bucket carries its own mutex, so
//! requests for different keys never contend on the same lock.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// Longest accepted window
pub const MAX_WINDOW: Duration = Duration::from_secs(86_400);

struct Bucket {
    remaining: u32,
    last_refill: Instant,
    last_seen: Instant,
}

/// Fixed-window token bucket per key
///
/// A burst straddling a window boundary can admit up to twice the capacity.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Create a limiter admitting `capacity` requests per key per `window`
    pub fn new(capacity: u32, window: Duration) -> Result<Self, AuthError> {
        if capacity == 0 {
            return Err(AuthError::Config("rate limit capacity must be positive".into()));
        }
        if window.is_zero() {
            return Err(AuthError::Config("rate limit window must be positive".into()));
        }
        if window > MAX_WINDOW {
            return Err(AuthError::Config(format!(
                "rate limit window must not exceed {}s",
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(Self {
            capacity,
            window,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Idle time after which a bucket is reaped
    pub fn idle_ttl(&self) -> Duration {
        self.window * 2
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return bucket.clone();
        }

        let now = Instant::now();
        self.buckets
            .write()
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    remaining: self.capacity,
                    last_refill: now,
                    last_seen: now,
                }))
            })
            .clone()
    }

    /// Take one permit for `key`, refilling first if the window has passed
    pub fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        self.admit(&bucket)
    }

    fn admit(&self, bucket: &Mutex<Bucket>) -> bool {
        let mut bucket = bucket.lock();

        let now = Instant::now();
        bucket.last_seen = now;
        if now.duration_since(bucket.last_refill) > self.window {
            bucket.remaining = self.capacity;
            bucket.last_refill = now;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for longer than two windows, returning how many went
    ///
    /// A bucket some caller has fetched but not yet locked is kept, so its
    /// permit is taken from the bucket that stays in the map.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.idle_ttl();

        let mut buckets = self.buckets.write();
        let before = buckets.len();
        // Handles are only cloned under the map lock, so the count is stable here
        buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1
                || now.duration_since(bucket.lock().last_seen) <= idle_ttl
        });
        before - buckets.len()
    }

    /// Reap idle buckets every two windows until `cancel` fires
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.idle_ttl();
        info!("Starting rate limiter sweeper (interval: {:?})", period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);

            // Skip the first tick (which fires immediately)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Rate limiter sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.sweep_idle();
                        if evicted > 0 {
                            debug!("Evicted {} idle rate limit buckets", evicted);
                        }
                    }
                }
            }
        })
    }
}

/// Best-effort client address for a request
///
/// Forwarding headers are only consulted when the deployment sits behind a
/// proxy that sets them; otherwise they are client-controlled.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
) -> Option<IpAddr> {
    if trust_forwarded_headers {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }

    peer.map(|addr| addr.ip())
}

/// Shared state for [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub trust_forwarded_headers: bool,
}

/// Reject requests over the per-client budget with 429
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_ip(request.headers(), peer, state.trust_forwarded_headers)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.limiter.allow(&key) {
        warn!("Rate limit exceeded for {}", key);
        metrics::counter!("ridepass_rate_limited_total").increment(1);
        return Err(AuthError::RateLimited);
    }

    Ok(next.run(request).await)
}
