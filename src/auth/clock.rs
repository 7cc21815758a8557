//! Time source for expiration checks.
//!
//! Expiration is computed against a [`Clock`] instead of calling
//! `Utc::now()` directly so the engine can run against tokio's paused clock.

use chrono::{DateTime, Duration, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time derived from tokio's monotonic clock.
///
/// Anchored to the system time at construction. Under
/// `tokio::time::pause()` it advances only when tokio time does, which keeps
/// credential expiry consistent with scheduled sleeps.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor: Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.start.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_tracks_utc() {
        let before = Utc::now();
        let now = SystemClock.now();
        assert!(now >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_paused_time() {
        let clock = MonotonicClock::new();
        let t0 = clock.now();

        tokio::time::advance(std::time::Duration::from_secs(30)).await;

        assert_eq!(clock.now() - t0, Duration::seconds(30));
    }
}
