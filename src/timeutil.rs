//! Timestamp parsing and formatting shared by the pipeline and the
//! expression helpers.
//!
//! Upstream producers emit ISO-8601 with or without an offset; naive
//! timestamps are reinterpreted as UTC.

use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Parse an ISO-8601 datetime or date, assuming UTC when no offset is given.
pub fn parse_utc(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(odt) = OffsetDateTime::parse(raw, &Iso8601::DEFAULT) {
        return Some(odt.to_offset(UtcOffset::UTC));
    }
    if let Ok(pdt) = PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT) {
        return Some(pdt.assume_utc());
    }
    if let Ok(date) = Date::parse(raw, &Iso8601::DEFAULT) {
        return Some(date.midnight().assume_utc());
    }
    None
}

/// Microseconds since the Unix epoch.
pub fn to_micros(instant: OffsetDateTime) -> i64 {
    (instant.unix_timestamp_nanos() / 1_000) as i64
}

/// The inverse of [`to_micros`].
pub fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// RFC 3339 rendering, used wherever a timestamp re-enters a payload.
pub fn format_iso(instant: OffsetDateTime) -> String {
    instant
        .format(&Rfc3339)
        .unwrap_or_else(|_| instant.to_string())
}

/// Second-precision `YYYY-MM-DDTHH:MM:SS` rendering, the shape the
/// `_`/`%` date-match patterns are written against.
pub fn format_compact(instant: OffsetDateTime) -> String {
    const COMPACT: &[time::format_description::BorrowedFormatItem<'static>] =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    instant
        .format(&COMPACT)
        .unwrap_or_else(|_| instant.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_naive_as_utc() {
        let parsed = parse_utc("2025-01-02T03:04:05").unwrap();
        assert_eq!(parsed, datetime!(2025-01-02 03:04:05 UTC));
    }

    #[test]
    fn test_parse_with_offset() {
        let parsed = parse_utc("2025-01-02T03:04:05Z").unwrap();
        assert_eq!(parsed, datetime!(2025-01-02 03:04:05 UTC));
    }

    #[test]
    fn test_parse_date_only() {
        let parsed = parse_utc("2025-01-02").unwrap();
        assert_eq!(parsed, datetime!(2025-01-02 00:00:00 UTC));
    }

    #[test]
    fn test_micros_round_trip() {
        let instant = datetime!(2025-01-02 03:04:05.123456 UTC);
        assert_eq!(from_micros(to_micros(instant)), instant);
    }

    #[test]
    fn test_compact_format() {
        let instant = datetime!(2024-08-31 00:15:00 UTC);
        assert_eq!(format_compact(instant), "2024-08-31T00:15:00");
    }
}
