//! Wall-clock and monotonic time helpers shared across the crate.
//!
//! The protocol needs two distinct notions of time: a wall-clock
//! `authUnixTime` for the auth envelope and watchdog windows (seconds since
//! the Unix epoch), and a monotonic clock for timer deadlines that must never
//! run backwards across a system clock step.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, per the `authUnixTime`/`endTimeStatus` wall
/// clock used throughout the auth envelope and watchdog logic.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The `systemClock` tuple published to the Repository each tick: seconds and
/// nanoseconds since the Unix epoch (spec.md §4.7 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemClock {
    pub secs: u64,
    pub nanos: u32,
}

impl SystemClock {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        SystemClock {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }
}

/// One logical tick of the event loop: 100 microseconds of wall time
/// (`MIN_INTERVAL_USEC`, spec.md §4.7).
pub const MIN_INTERVAL_USEC: u64 = 100;

/// A monotonic deadline. Wraps `std::time::Instant` so timer arithmetic
/// (`prev + interval` rather than `now + interval`, spec.md §4.5) reads the
/// same way across the data-plane sender and the timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn now() -> Self {
        Deadline(Instant::now())
    }

    pub fn from_instant(i: Instant) -> Self {
        Deadline(i)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn plus(&self, d: Duration) -> Self {
        Deadline(self.0 + d)
    }

    pub fn has_elapsed(&self, now: Instant) -> bool {
        now >= self.0
    }

    /// How far `now` has overshot this deadline; zero if not yet due.
    pub fn overshoot(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_is_plausible() {
        let t = unix_time_secs();
        assert!(t > 1_700_000_000, "expected a post-2023 timestamp");
    }

    #[test]
    fn deadline_overshoot_zero_when_not_due() {
        let d = Deadline::now().plus(Duration::from_secs(10));
        assert_eq!(d.overshoot(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn deadline_overshoot_measures_slip() {
        let base = Instant::now();
        let d = Deadline::from_instant(base);
        let later = base + Duration::from_millis(250);
        assert_eq!(d.overshoot(later), Duration::from_millis(250));
    }
}
