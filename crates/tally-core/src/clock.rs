//! Server clock.
//!
//! All persisted timestamps (document write stamps, audit snapshot times,
//! expiry instants) come from a [`ServerClock`], never from the client that
//! issued the write. Values are microseconds since the Unix epoch.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Microseconds in one day.
pub const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// Source of server-assigned timestamps.
pub trait ServerClock: Send + Sync {
    /// Current time in microseconds since the Unix epoch.
    fn now_us(&self) -> i64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ServerClock for SystemClock {
    fn now_us(&self) -> i64 {
        Utc::now().timestamp_micros()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_us: Arc<AtomicI64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: Arc::new(AtomicI64::new(start_us)),
        }
    }

    /// Move the clock forward (or backward, for skew tests) by `delta_us`.
    pub fn advance(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }
}

impl ServerClock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Render a microsecond timestamp as RFC 3339 for humans.
#[must_use]
pub fn format_us(ts_us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(ts_us)
        .map_or_else(|| ts_us.to_string(), |dt| dt.to_rfc3339())
}

/// Parse an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC).
#[must_use]
pub fn parse_instant_us(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).timestamp_micros());
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance(500);
        assert_eq!(other.now_us(), 1_500);
        other.set(42);
        assert_eq!(clock.now_us(), 42);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_us() > 1_577_836_800_000_000);
    }

    #[test]
    fn parse_date_and_rfc3339() {
        let day = parse_instant_us("2024-03-01").unwrap();
        let full = parse_instant_us("2024-03-01T00:00:00Z").unwrap();
        assert_eq!(day, full);
        assert!(parse_instant_us("yesterday").is_none());
    }

    #[test]
    fn format_roundtrips_through_parse() {
        let ts = 1_708_012_200_000_000;
        assert_eq!(parse_instant_us(&format_us(ts)), Some(ts));
    }
}
