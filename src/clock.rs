//! Wall-clock source and timestamp encoding.
//!
//! Timestamps are stored as fixed-width ISO-8601 UTC strings
//! (`2026-03-01T09:30:00.000Z`) so that lexicographic ordering on the column
//! equals chronological ordering. All comparisons in SQL rely on this.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

use crate::errors::QueueError;

/// Offset applied to `run_at` values that carry no timezone designator.
///
/// Naked local timestamps are interpreted at +05:30 and converted to UTC.
/// This is a product choice for the primary deployment locale, kept as a
/// single constant so it is easy to re-configure.
pub const LOCAL_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Formats accepted for naked (timezone-less) `run_at` input.
const NAKED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Encode a timestamp as a fixed-width ISO-8601 UTC string.
pub fn to_iso(t: DateTime<Utc>) -> String {
    t.format(ISO_FORMAT).to_string()
}

/// Current time as an ISO-8601 UTC string.
pub fn now_iso() -> String {
    to_iso(now())
}

/// ISO-8601 UTC string for a point `seconds` from now. Used for retry
/// backoff deadlines.
pub fn iso_after(seconds: i64) -> String {
    to_iso(now() + chrono::Duration::seconds(seconds))
}

/// Parse a user-supplied `run_at` value into the stored ISO-8601 UTC form.
///
/// Input with an explicit timezone designator is converted to UTC. Naked
/// local timestamps are interpreted at [`LOCAL_UTC_OFFSET_SECS`].
pub fn parse_run_at(input: &str) -> Result<String, QueueError> {
    let input = input.trim();

    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(to_iso(t.with_timezone(&Utc)));
    }

    let offset = FixedOffset::east_opt(LOCAL_UTC_OFFSET_SECS)
        .expect("offset is within +/-24h");
    for format in NAKED_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            let local = naive
                .and_local_timezone(offset)
                .single()
                .ok_or_else(|| {
                    QueueError::InvalidInput(format!("ambiguous run_at: {input}"))
                })?;
            return Ok(to_iso(local.with_timezone(&Utc)));
        }
    }

    Err(QueueError::InvalidInput(format!(
        "unparseable run_at: {input}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_utc_passes_through() {
        let got = parse_run_at("2030-01-15T10:00:00Z").unwrap();
        assert_eq!(got, "2030-01-15T10:00:00.000Z");
    }

    #[test]
    fn explicit_offset_converts_to_utc() {
        let got = parse_run_at("2030-01-15T10:00:00+02:00").unwrap();
        assert_eq!(got, "2030-01-15T08:00:00.000Z");
    }

    #[test]
    fn naked_timestamp_is_local_plus_0530() {
        let got = parse_run_at("2030-01-15T10:00:00").unwrap();
        assert_eq!(got, "2030-01-15T04:30:00.000Z");
    }

    #[test]
    fn naked_timestamp_with_space_and_fraction() {
        let got = parse_run_at("2030-01-15 10:00:00.250").unwrap();
        assert_eq!(got, "2030-01-15T04:30:00.250Z");
    }

    #[test]
    fn minute_precision_accepted() {
        let got = parse_run_at("2030-01-15T06:00").unwrap();
        assert_eq!(got, "2030-01-15T00:30:00.000Z");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_run_at("next tuesday"),
            Err(QueueError::InvalidInput(_))
        ));
    }

    #[test]
    fn iso_strings_order_chronologically() {
        let earlier = to_iso(now());
        let later = iso_after(30);
        assert!(earlier < later);
    }
}
