//! Timestamp utilities and time bucketing for trends

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Storage form of timestamps: RFC 3339 with microseconds, `Z` suffix.
///
/// Fixed width keeps lexical order equal to chronological order.
pub fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_db_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", s, e)))
}

/// Parse a `YYYY-MM-DD` date with dashed components
pub fn parse_iso_date(s: &str) -> Result<NaiveDate> {
    let parts: Vec<&str> = s.trim().split('-').collect();
    if parts.len() != 3 || parts[0].len() != 4 || parts[1].len() != 2 || parts[2].len() != 2 {
        return Err(Error::InvalidInput(format!(
            "Date '{}' must be formatted as YYYY-MM-DD",
            s
        )));
    }
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| Error::InvalidInput(format!("Invalid date '{}': {}", s, e)))
}

/// Trend bucket granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    Daily,
    Weekly,
    Monthly,
}

impl TimeFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(TimeFormat::Daily),
            "weekly" => Ok(TimeFormat::Weekly),
            "monthly" => Ok(TimeFormat::Monthly),
            other => Err(Error::InvalidInput(format!(
                "Unknown time format '{}' (expected daily, weekly or monthly)",
                other
            ))),
        }
    }

    /// First day of the bucket containing `ts` (weeks start on Monday)
    pub fn bucket_start(&self, ts: &DateTime<Utc>) -> NaiveDate {
        let date = ts.date_naive();
        match self {
            TimeFormat::Daily => date,
            TimeFormat::Weekly => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            TimeFormat::Monthly => date.with_day(1).unwrap_or(date),
        }
    }

    /// Sortable bucket label (`YYYY-MM-DD` of the bucket start)
    pub fn bucket_label(&self, ts: &DateTime<Utc>) -> String {
        self.bucket_start(ts).format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
    }

    #[test]
    fn test_db_timestamp_round_trip_and_ordering() {
        let a = Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap();
        let b = a + Duration::microseconds(1);
        let (sa, sb) = (to_db_timestamp(&a), to_db_timestamp(&b));
        assert!(sa < sb);
        assert_eq!(parse_db_timestamp(&sa).unwrap(), a);
    }

    #[test]
    fn test_parse_iso_date_requires_dashed_components() {
        assert_eq!(
            parse_iso_date("2024-01-31").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
        );
        assert!(parse_iso_date("2024/01/31").is_err());
        assert!(parse_iso_date("20240131").is_err());
        assert!(parse_iso_date("2024-1-31").is_err());
        assert!(parse_iso_date("2024-02-30").is_err());
    }

    #[test]
    fn test_bucket_start_per_format() {
        // 2024-05-16 is a Thursday
        let ts = Utc.with_ymd_and_hms(2024, 5, 16, 23, 59, 0).unwrap();
        assert_eq!(TimeFormat::Daily.bucket_label(&ts), "2024-05-16");
        assert_eq!(TimeFormat::Weekly.bucket_label(&ts), "2024-05-13");
        assert_eq!(TimeFormat::Monthly.bucket_label(&ts), "2024-05-01");
    }

    #[test]
    fn test_time_format_parse() {
        assert_eq!(TimeFormat::parse("Weekly").unwrap(), TimeFormat::Weekly);
        assert!(TimeFormat::parse("hourly").is_err());
    }
}
