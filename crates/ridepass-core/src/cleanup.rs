//! Background purge of expired ledger rows

use chrono::{DateTime, Utc};
use ridepass_db::{RefreshTokenStore, VerificationTokenStore, with_deadline};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Budget for a single ledger purge
pub const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows removed by one sweep; `None` marks a ledger whose purge failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refresh_deleted: Option<u64>,
    pub verification_deleted: Option<u64>,
}

impl SweepReport {
    pub fn is_complete(&self) -> bool {
        self.refresh_deleted.is_some() && self.verification_deleted.is_some()
    }

    pub fn total(&self) -> u64 {
        self.refresh_deleted.unwrap_or(0) + self.verification_deleted.unwrap_or(0)
    }
}

pub struct CleanupSweeper {
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    verification_tokens: Arc<dyn VerificationTokenStore>,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        verification_tokens: Arc<dyn VerificationTokenStore>,
        interval: Duration,
    ) -> Self {
        Self {
            refresh_tokens,
            verification_tokens,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delete rows that expired before `now` from both ledgers
    ///
    /// A failure in one ledger is logged and does not stop the other.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let refresh = with_deadline(SWEEP_TIMEOUT, self.refresh_tokens.delete_expired(now)).await;
        let verification = with_deadline(
            SWEEP_TIMEOUT,
            self.verification_tokens.delete_expired(now),
        )
        .await;

        let refresh_deleted = match refresh {
            Ok(count) => {
                metrics::counter!("ridepass_cleanup_deleted_total", "ledger" => "refresh")
                    .increment(count);
                Some(count)
            }
            Err(e) => {
                warn!("Failed to purge expired refresh tokens: {}", e);
                None
            }
        };
        let verification_deleted = match verification {
            Ok(count) => {
                metrics::counter!("ridepass_cleanup_deleted_total", "ledger" => "verification")
                    .increment(count);
                Some(count)
            }
            Err(e) => {
                warn!("Failed to purge expired verification tokens: {}", e);
                None
            }
        };

        SweepReport {
            refresh_deleted,
            verification_deleted,
        }
    }

    /// Sweep every interval until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting token cleanup task (interval: {:?})",
            self.interval
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);

            // Skip the first tick (which fires immediately)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Token cleanup task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.run_once(Utc::now()).await;
                        if report.total() > 0 {
                            info!(
                                "Scheduled cleanup: {} refresh and {} verification tokens removed",
                                report.refresh_deleted.unwrap_or(0),
                                report.verification_deleted.unwrap_or(0)
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as TimeDelta, TimeZone};
    use ridepass_db::{
        ClientMeta, DbError, InMemoryRefreshTokenStore, InMemoryVerificationTokenStore,
        IssuedToken, RefreshToken, VerificationPurpose,
    };
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    struct BrokenRefreshStore;

    #[async_trait]
    impl RefreshTokenStore for BrokenRefreshStore {
        async fn create(
            &self,
            _: Uuid,
            _: &ClientMeta,
            _: TimeDelta,
            _: DateTime<Utc>,
        ) -> Result<IssuedToken<RefreshToken>, DbError> {
            Err(DbError::Timeout)
        }

        async fn rotate(
            &self,
            _: Uuid,
            _: Uuid,
            _: &ClientMeta,
            _: TimeDelta,
            _: DateTime<Utc>,
        ) -> Result<IssuedToken<RefreshToken>, DbError> {
            Err(DbError::Timeout)
        }

        async fn find_by_hash(&self, _: &str) -> Result<Option<RefreshToken>, DbError> {
            Err(DbError::Timeout)
        }

        async fn revoke(&self, _: Uuid, _: DateTime<Utc>) -> Result<(), DbError> {
            Err(DbError::Timeout)
        }

        async fn revoke_by_hash(&self, _: &str, _: DateTime<Utc>) -> Result<(), DbError> {
            Err(DbError::Timeout)
        }

        async fn revoke_all_for_user(&self, _: Uuid, _: DateTime<Utc>) -> Result<u64, DbError> {
            Err(DbError::Timeout)
        }

        async fn delete_expired(&self, _: DateTime<Utc>) -> Result<u64, DbError> {
            Err(DbError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_run_once_deletes_only_expired() {
        let refresh = InMemoryRefreshTokenStore::new();
        let verification = InMemoryVerificationTokenStore::new();
        let meta = ClientMeta::default();
        let user = Uuid::new_v4();

        let expired = refresh
            .create(user, &meta, TimeDelta::hours(1), t0() - TimeDelta::hours(2))
            .await
            .unwrap();
        let live = refresh
            .create(user, &meta, TimeDelta::hours(1), t0())
            .await
            .unwrap();
        verification
            .create(
                user,
                VerificationPurpose::RiderConfirm,
                &meta,
                TimeDelta::minutes(30),
                t0() - TimeDelta::hours(1),
            )
            .await
            .unwrap();
        verification
            .create(
                user,
                VerificationPurpose::PasswordReset,
                &meta,
                TimeDelta::minutes(30),
                t0(),
            )
            .await
            .unwrap();

        let sweeper = CleanupSweeper::new(
            Arc::new(refresh.clone()),
            Arc::new(verification.clone()),
            Duration::from_secs(60),
        );
        let report = sweeper.run_once(t0()).await;

        assert_eq!(
            report,
            SweepReport {
                refresh_deleted: Some(1),
                verification_deleted: Some(1),
            }
        );
        assert!(
            refresh
                .find_by_hash(&expired.record.token_hash)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            refresh
                .find_by_hash(&live.record.token_hash)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_failing_ledger_does_not_block_other() {
        let verification = InMemoryVerificationTokenStore::new();
        verification
            .create(
                Uuid::new_v4(),
                VerificationPurpose::DriverConfirm,
                &ClientMeta::default(),
                TimeDelta::minutes(30),
                t0() - TimeDelta::days(1),
            )
            .await
            .unwrap();

        let sweeper = CleanupSweeper::new(
            Arc::new(BrokenRefreshStore),
            Arc::new(verification),
            Duration::from_secs(60),
        );
        let report = sweeper.run_once(t0()).await;

        assert!(!report.is_complete());
        assert_eq!(report.refresh_deleted, None);
        assert_eq!(report.verification_deleted, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_until_cancelled() {
        let refresh = InMemoryRefreshTokenStore::new();
        let verification = InMemoryVerificationTokenStore::new();
        let stale = refresh
            .create(
                Uuid::new_v4(),
                &ClientMeta::default(),
                TimeDelta::hours(1),
                Utc::now() - TimeDelta::days(2),
            )
            .await
            .unwrap();

        let interval = Duration::from_secs(3600);
        let sweeper = Arc::new(CleanupSweeper::new(
            Arc::new(refresh.clone()),
            Arc::new(verification),
            interval,
        ));
        let cancel = CancellationToken::new();
        let handle = sweeper.spawn(cancel.clone());

        tokio::time::sleep(interval + Duration::from_secs(1)).await;
        assert!(
            refresh
                .find_by_hash(&stale.record.token_hash)
                .await
                .unwrap()
                .is_none()
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
