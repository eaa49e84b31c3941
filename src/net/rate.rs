//! Closed-loop rate controller: walks a connection's sending-rate index up
//! or down based on the delay-variation/loss classification of each trial
//! (spec.md §4.6, C6).
//!
//! Two algorithms are supported. Algorithm B is "balanced": it steps down
//! aggressively under congestion but halves its own step size after
//! `slowAdjThresh` consecutive congested trials, converging from above.
//! Algorithm C is "conservative": every congested trial drops exactly one
//! index and then holds (dwells) for `slowAdjThresh` trials before trying to
//! climb again, trading convergence speed for stability.
//!
//! The exact index-step formula beyond `highSpeedDelta`/`hSpeedThresh` is a
//! reconstruction (spec.md §9 Open Questions; the reference table generator
//! was not available) — see DESIGN.md. What is load-bearing and tested here
//! is the shape every caller of this module depends on: index never goes
//! negative or out of table bounds, and repeated "steady" classification
//! converges instead of oscillating forever.

use serde::{Deserialize, Serialize};

use crate::net::srate::MAX_SENDING_RATES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateAdjAlgo {
    B,
    C,
}

/// Per-trial classification fed to the controller, derived from a trial's
/// delay-variation and sequence-error counts against `lowThresh`/`upperThresh`
/// and `seqErrThresh` (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialClass {
    /// Delay variation at/above `upperThresh`, or sequence errors at/above
    /// `seqErrThresh`.
    Congested,
    /// Delay variation at/below `lowThresh` and no sequence errors.
    UnderUtilised,
    /// Between the two thresholds.
    Steady,
}

/// Row index the rate controller is steering toward. Index 0 is slowest,
/// `MAX_SENDING_RATES - 1` is fastest.
pub type SrIndex = u16;

/// How the connection's starting index is chosen (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Use the implementation default starting index.
    Default,
    /// Start at a configured index but continue to adapt from there.
    Start(SrIndex),
    /// Pin to a configured index; the controller never moves it.
    Fixed(SrIndex),
}

/// Default starting row for `StartMode::Default` (spec.md §4.6: "If
/// srIndexConf = DEF (default/auto): start at 0"). The controller ramps up
/// from the bottom of the table rather than assuming any prior knowledge of
/// link capacity.
pub const DEFAULT_START_INDEX: SrIndex = 0;

/// Above this index, a congested classification steps down by
/// `high_speed_delta` instead of 1, since at high rates a single-row step is
/// too small to meaningfully relieve congestion within one trial.
pub const DEFAULT_HSPEED_THRESH: SrIndex = 300;

#[derive(Debug, Clone)]
pub struct RateController {
    algo: RateAdjAlgo,
    index: SrIndex,
    fixed: bool,
    high_speed_thresh: SrIndex,
    high_speed_delta: SrIndex,
    slow_adj_thresh: u32,
    /// Algorithm B: current down-step size for this congestion streak. `0`
    /// means no streak is in progress; it is seeded from `step_size()` on
    /// the first congested trial of a streak and halved every
    /// `slow_adj_thresh` consecutive congested trials after that, reset to
    /// `0` only when a non-congested trial breaks the streak.
    step: SrIndex,
    consecutive_congested: u32,
    /// Algorithm C: trials remaining before the dwell period ends.
    dwell_remaining: u32,
}

impl RateController {
    pub fn new(algo: RateAdjAlgo, start: StartMode, high_speed_delta: u16, slow_adj_thresh: u32) -> Self {
        let (index, fixed) = match start {
            StartMode::Default => (DEFAULT_START_INDEX, false),
            StartMode::Start(i) => (i, false),
            StartMode::Fixed(i) => (i, true),
        };
        RateController {
            algo,
            index,
            fixed,
            high_speed_thresh: DEFAULT_HSPEED_THRESH,
            high_speed_delta,
            slow_adj_thresh: slow_adj_thresh.max(1),
            step: 0,
            consecutive_congested: 0,
            dwell_remaining: 0,
        }
    }

    pub fn index(&self) -> SrIndex {
        self.index
    }

    fn step_size(&self) -> SrIndex {
        if self.index >= self.high_speed_thresh {
            self.high_speed_delta.max(1)
        } else {
            1
        }
    }

    /// Fold in one trial's classification, returning the (possibly
    /// unchanged) new index. No-op when the controller is in `Fixed` mode.
    pub fn on_trial(&mut self, class: TrialClass) -> SrIndex {
        if self.fixed {
            return self.index;
        }
        match self.algo {
            RateAdjAlgo::B => self.on_trial_b(class),
            RateAdjAlgo::C => self.on_trial_c(class),
        }
        self.index
    }

    fn on_trial_b(&mut self, class: TrialClass) {
        match class {
            TrialClass::Congested => {
                self.consecutive_congested += 1;
                if self.step == 0 {
                    self.step = self.step_size();
                }
                if self.consecutive_congested % self.slow_adj_thresh == 0 {
                    self.step = (self.step / 2).max(1);
                }
                self.index = self.index.saturating_sub(self.step);
            }
            TrialClass::UnderUtilised => {
                self.consecutive_congested = 0;
                self.step = 0;
                let max_index = (MAX_SENDING_RATES - 1) as SrIndex;
                self.index = (self.index + self.step_size()).min(max_index);
            }
            TrialClass::Steady => {
                self.consecutive_congested = 0;
                self.step = 0;
            }
        }
    }

    fn on_trial_c(&mut self, class: TrialClass) {
        match class {
            // A congested trial always drops the index by one and re-arms
            // the dwell, even mid-dwell: the dwell only ever suppresses
            // upward moves (spec.md §4.6: "during which only downward moves
            // occur").
            TrialClass::Congested => {
                self.index = self.index.saturating_sub(1);
                self.dwell_remaining = self.slow_adj_thresh;
            }
            TrialClass::UnderUtilised => {
                if self.dwell_remaining > 0 {
                    self.dwell_remaining -= 1;
                    return;
                }
                let max_index = (MAX_SENDING_RATES - 1) as SrIndex;
                self.index = (self.index + self.step_size()).min(max_index);
            }
            TrialClass::Steady => {
                if self.dwell_remaining > 0 {
                    self.dwell_remaining -= 1;
                }
            }
        }
    }
}
