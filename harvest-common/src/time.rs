//! Timestamp and calendar-day utilities
//!
//! All calendar days are UTC. Dates are stored as `YYYY-MM-DD` text so that
//! lexical order in SQLite equals chronological order.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};

/// Storage format for calendar days
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC calendar day
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Day used as the lower bound when no model has ever been trained
pub fn epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

/// Format a calendar day for storage
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a stored or user-supplied calendar day
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|e| Error::InvalidInput(format!("Invalid date '{}': {}", value, e)))
}

/// Parse a stored RFC3339 timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_epoch_date() {
        assert_eq!(format_date(epoch_date()), "1970-01-01");
    }

    #[test]
    fn test_date_round_trip_preserves_ordering() {
        let earlier = parse_date("2024-02-09").unwrap();
        let later = parse_date("2024-02-10").unwrap();
        assert!(earlier < later);
        assert!(format_date(earlier) < format_date(later));
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        let err = parse_date("10/02/2024").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("2024-03-01T12:30:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:30:00+00:00");
        assert!(parse_timestamp("yesterday").is_err());
    }
}
