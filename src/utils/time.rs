//! Time handling: persisted timestamps use the Helsinki zone, exchange
//! timestamps arrive as milliseconds UTC and are converted once here.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Europe::Helsinki;
use chrono_tz::Tz;

/// Current time in the account's configured zone.
pub fn now_helsinki() -> DateTime<Tz> {
    Utc::now().with_timezone(&Helsinki)
}

/// ISO-8601 string for persisted timestamps.
pub fn helsinki_iso(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Helsinki).to_rfc3339()
}

/// ISO-8601 string of the current Helsinki time.
pub fn now_helsinki_iso() -> String {
    now_helsinki().to_rfc3339()
}

/// Convert exchange milliseconds (UTC) into a `DateTime<Utc>`.
///
/// Out-of-range values clamp to the epoch rather than panicking; the
/// exchange should never send them but a malformed payload must not take
/// the event loop down.
pub fn from_exchange_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

/// Milliseconds since the epoch for outgoing exchange requests.
pub fn to_exchange_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_ms_round_trip() {
        let ts = from_exchange_ms(1_700_000_000_000);
        assert_eq!(to_exchange_ms(ts), 1_700_000_000_000);
    }

    #[test]
    fn test_helsinki_offset() {
        // Helsinki is UTC+2 (winter) or UTC+3 (summer); either way the
        // formatted string must carry an explicit offset.
        let iso = helsinki_iso(from_exchange_ms(1_700_000_000_000));
        assert!(iso.contains("+02:00") || iso.contains("+03:00"));
    }

    #[test]
    fn test_malformed_ms_clamps() {
        assert_eq!(from_exchange_ms(i64::MAX).timestamp_millis(), 0);
    }
}
