//! Shared utility functions

use chrono::{DateTime, SecondsFormat, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::DbError;

/// Format a timestamp for storage
///
/// Always emits microsecond precision and a `Z` suffix so that every stored
/// value has the same width and SQL string comparison matches time ordering.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use ridepass_db::utils::format_datetime;
///
/// let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
/// assert_eq!(format_datetime(t), "2024-01-01T12:00:00.000000Z");
/// ```
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC3339 timestamp
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

/// Parse an optional stored timestamp
pub fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Run a store operation under a deadline
///
/// When the deadline elapses the inner future is dropped. Any transaction it
/// held is rolled back by sqlx when its handle goes out of scope.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::seconds(1);

        assert_eq!(format_datetime(a).len(), format_datetime(b).len());
        assert!(format_datetime(a) < format_datetime(b));
        assert!(format_datetime(b) < format_datetime(c));
    }

    #[test]
    fn test_parse_datetime() {
        let parsed = parse_datetime("2024-01-01T12:00:00.000000Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());

        let parsed = parse_datetime("2024-01-01T14:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());

        assert!(matches!(parse_datetime("invalid"), Err(DbError::Corrupt(_))));
        assert_eq!(parse_optional_datetime(None).unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok::<_, DbError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let slow = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DbError>(())
        })
        .await;
        assert!(matches!(slow, Err(DbError::Timeout)));
    }
}
