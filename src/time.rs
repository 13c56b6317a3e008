//! Time abstraction for testable tickers and timer buckets.
//!
//! Production code reads the system clock; tests drive a virtual clock so
//! timer-scan and staleness behavior is deterministic.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time.
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;

    /// Current instant as a UTC datetime.
    fn now_utc(&self) -> DateTime<Utc> {
        let millis = self.now_millis();
        Utc.timestamp_millis_opt(millis as i64)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch is valid"))
    }

    /// Current instant as an RFC3339 string at second granularity, the
    /// format used for timer buckets and doc-timer cursors.
    fn now_rfc3339(&self) -> String {
        self.now_utc().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// Reads the real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        SystemTimeSource
    }
}

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Virtual clock for tests; starts at a fixed instant and only moves when
/// advanced explicitly.
#[derive(Debug, Clone)]
pub struct SimulatedTimeSource {
    millis: Arc<AtomicU64>,
}

impl SimulatedTimeSource {
    pub fn new(start_millis: u64) -> Self {
        SimulatedTimeSource {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Start at an RFC3339 instant; panics on malformed input (test-only).
    pub fn at(rfc3339: &str) -> Self {
        let parsed = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid RFC3339 start instant")
            .with_timezone(&Utc);
        Self::new(parsed.timestamp_millis().max(0) as u64)
    }

    pub fn advance_millis(&self, delta: u64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta: u64) {
        self.advance_millis(delta * 1000);
    }
}

impl TimeSource for SimulatedTimeSource {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Parse an RFC3339 timestamp, tolerating both `Z` and offset suffixes.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances() {
        let clock = SimulatedTimeSource::at("2025-01-01T00:00:00Z");
        let start = clock.now_millis();
        clock.advance_secs(2);
        assert_eq!(clock.now_millis(), start + 2000);
        assert_eq!(clock.now_rfc3339(), "2025-01-01T00:00:02Z");
    }

    #[test]
    fn rfc3339_second_granularity() {
        let clock = SimulatedTimeSource::at("2025-06-15T10:20:30Z");
        clock.advance_millis(750);
        assert_eq!(clock.now_rfc3339(), "2025-06-15T10:20:30Z");
    }

    #[test]
    fn parse_accepts_offsets() {
        let a = parse_rfc3339("2025-01-01T00:00:01Z").unwrap();
        let b = parse_rfc3339("2025-01-01T01:00:01+01:00").unwrap();
        assert_eq!(a, b);
    }
}
