// ⏰ Temporal Parsing - Tolerant timestamps for "last seen" signals
//
// Feeds stamp their rows however they like: ISO with offsets, naive
// "YYYY-MM-DD HH:mm" wall-clock times, US dates, epoch numbers.
// Nothing here ever fails loudly: a value we can't read is simply None.

use crate::fields::{fold_key, Row};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Naive formats interpreted as local wall-clock time
const LOCAL_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// Generic fallback formats (also local time)
const FALLBACK_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const FALLBACK_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Offset-carrying formats beyond strict RFC 3339
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Key fragments that mark a value as timestamp-like (matched on folded keys)
const TIMESTAMP_KEY_FRAGMENTS: &[&str] = &[
    "date", "time", "timestamp", "seen", "updated", "created", "clock", "punch",
];

/// Epoch values above this are treated as milliseconds
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

// ============================================================================
// PARSING
// ============================================================================

/// Parse a timestamp string, returning None for anything unreadable
///
/// Accepts, in order:
/// 1. ISO 8601 / RFC 3339 with a timezone offset
/// 2. "YYYY-MM-DD HH:mm[:ss]" as local time
/// 3. a handful of generic naive datetime and date-only formats (local)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in LOCAL_DATETIME_FORMATS.iter().chain(FALLBACK_DATETIME_FORMATS) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local_to_utc(naive);
        }
    }

    for fmt in FALLBACK_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).and_then(local_to_utc);
        }
    }

    None
}

/// Parse a JSON value: strings via `parse_timestamp`, numbers as epoch time
pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let n = n.as_f64()?;
            if !n.is_finite() || n <= 0.0 {
                return None;
            }
            let millis = if n > EPOCH_MILLIS_CUTOFF { n } else { n * 1000.0 };
            DateTime::from_timestamp_millis(millis as i64)
        }
        _ => None,
    }
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    // DST gaps have no local representation; ambiguous times take the earlier instant
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// DISCOVERY
// ============================================================================

/// Whether a row key names a timestamp-like value
pub fn is_timestamp_key(key: &str) -> bool {
    let lower = key.trim().to_lowercase();
    if lower.ends_with("_at") || lower.ends_with(" at") {
        return true;
    }
    let folded = fold_key(key);
    TIMESTAMP_KEY_FRAGMENTS
        .iter()
        .any(|fragment| folded.contains(fragment))
}

/// Latest parseable timestamp among all timestamp-like values on a row
pub fn last_seen(row: &Row) -> Option<DateTime<Utc>> {
    row.iter()
        .filter(|(key, _)| is_timestamp_key(key))
        .filter_map(|(_, value)| parse_timestamp_value(value))
        .max()
}

// ============================================================================
// TESTS
// ============================================================================
