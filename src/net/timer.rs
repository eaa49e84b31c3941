//! Single-threaded cooperative event loop: a 100µs tick that drives each
//! connection's per-connection timers and the test-wide watchdog (spec.md
//! §4.7, §5, C7).
//!
//! The only suspension points are the host event poll (`tokio::select!`
//! across the tick interval and socket readiness) and non-blocking socket
//! I/O; handlers never hold an `.await` across a tick boundary, so a
//! connection's scratch buffers never need to survive a suspension point.

use std::time::Duration;

use tokio::time::{interval, Instant as TokioInstant, MissedTickBehavior};
use tracing::warn;

use crate::error::UdpstError;
use crate::time::{Deadline, MIN_INTERVAL_USEC};

/// The three per-connection timers the reference keeps alongside the
/// watchdog: timer1 (data send schedule), timer2 (status/feedback
/// cadence), timer3 (auxiliary — retransmit of unacked control PDUs).
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimers {
    pub timer1: Option<Deadline>,
    pub timer2: Option<Deadline>,
    pub timer3: Option<Deadline>,
    /// Watchdog: if no traffic arrives before this deadline, the connection
    /// is torn down with `UdpstError::Timeout`.
    pub end_time: Deadline,
}

impl ConnectionTimers {
    pub fn new(now: Deadline, watchdog: Duration) -> Self {
        ConnectionTimers { timer1: None, timer2: None, timer3: None, end_time: now.plus(watchdog) }
    }

    pub fn bump_watchdog(&mut self, now: Deadline, watchdog: Duration) {
        self.end_time = now.plus(watchdog);
    }

    /// Which of this connection's armed timers (if any) is due at `now`,
    /// checked in timer1 > timer2 > timer3 > watchdog priority order, as the
    /// reference's dispatch loop does.
    pub fn due(&self, now: &Deadline) -> Option<TimerKind> {
        let instant = now.instant();
        if self.timer1.map_or(false, |d| d.has_elapsed(instant)) {
            return Some(TimerKind::Timer1);
        }
        if self.timer2.map_or(false, |d| d.has_elapsed(instant)) {
            return Some(TimerKind::Timer2);
        }
        if self.timer3.map_or(false, |d| d.has_elapsed(instant)) {
            return Some(TimerKind::Timer3);
        }
        if self.end_time.has_elapsed(instant) {
            return Some(TimerKind::Watchdog);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timer1,
    Timer2,
    Timer3,
    Watchdog,
}

/// Drives the `MIN_INTERVAL_USEC` tick. Each tick, the caller is handed
/// `tick()`'s `Instant` and is responsible for walking its own connection
/// table checking `ConnectionTimers::due`.
pub struct EventLoop {
    ticker: tokio::time::Interval,
}

impl EventLoop {
    pub fn new() -> Self {
        let mut ticker = interval(Duration::from_micros(MIN_INTERVAL_USEC));
        // A stalled host (GC pause, scheduler contention) should not cause a
        // burst of queued ticks to fire back-to-back; catch up to "now" and
        // let per-connection deadline arithmetic (`prev + interval`) absorb
        // the slip instead.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        EventLoop { ticker }
    }

    pub async fn tick(&mut self) -> Deadline {
        let instant: TokioInstant = self.ticker.tick().await;
        Deadline::from_instant(instant.into_std())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Check one connection's timers against `now`, returning the error to
/// raise (if any) for a fired watchdog. Timer1/2/3 firings are left to the
/// caller to dispatch to the data/control handlers since their action
/// depends on connection state this module doesn't own.
pub fn check_watchdog(timers: &ConnectionTimers, now: &Deadline, conn_id: u32) -> Result<(), UdpstError> {
    if timers.end_time.has_elapsed(now.instant()) {
        warn!(conn_id, "connection watchdog expired with no traffic");
        return Err(UdpstError::Timeout(timers.end_time.overshoot(now.instant()).as_secs()));
    }
    Ok(())
}
