//! Wall-clock time for expiry decisions.
//!
//! Every deadline in the crate (session age, round timeout, lockout,
//! recovery token lifetime, cache TTL) is read through a [`Clock`] so tests
//! can move time forward without sleeping. Elapsed-time measurement for the
//! timing guard uses `std::time::Instant` directly and is not affected.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Source of wall-clock time in Unix milliseconds
pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds
    fn now_millis(&self) -> i64;

    /// Milliseconds elapsed since `since`, saturating at zero
    fn elapsed_since(&self, since: i64) -> Duration {
        let delta = self.now_millis().saturating_sub(since);
        Duration::from_millis(delta.max(0) as u64)
    }
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        now_timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Start at the given Unix millisecond timestamp
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(now_timestamp_millis())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        // Should be after 2024-01-01 (1704067200)
        assert!(ts > 1704067200, "Timestamp {} is too old", ts);
        // Should be before 2100-01-01 (4102444800)
        assert!(ts < 4102444800, "Timestamp {} is too far in future", ts);
    }

    #[test]
    fn test_system_clock_matches_millis() {
        let clock = SystemClock;
        let ts = clock.now_millis();
        assert!(ts > 1704067200_000, "Timestamp {} is too old", ts);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        assert_eq!(clock.elapsed_since(500), Duration::from_millis(2_500));

        // Timestamps in the future never produce negative durations
        assert_eq!(clock.elapsed_since(10_000), Duration::ZERO);
    }
}
