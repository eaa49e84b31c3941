//! Aggregates per-connection sub-interval stats into a group-wide rollup for
//! multi-connection tests, and produces the end-of-test summary (spec.md
//! §4.8, C8).
//!
//! The first `bimodal_count` sub-intervals of a test are reported
//! individually rather than folded into the running average — a link's
//! ramp-up behavior is often the interesting part of a short test, and
//! averaging it away from the start would hide it (spec.md §3, §4.8
//! "bimodal phase reporting").

use crate::net::conn::PerfStatsCounters;
use crate::net::data::{fold_range, SubIntervalStats, STATUS_NODEL};
use crate::time::SystemClock;

fn now_usec() -> i64 {
    let c = SystemClock::now();
    c.secs as i64 * 1_000_000 + c.nanos as i64 / 1000
}

/// One sub-interval's rollup across every connection in a `mcIdent` group.
/// `(t_start_usec, t_end_usec, bps(), loss_ratio(), ooo_ratio(), dup_ratio(),
/// delay_var_min/max_usec, rtt_min/max_usec, connections_reporting)` is the
/// C8 rollup row of spec.md §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSubInterval {
    pub index: u32,
    pub connections_reporting: u32,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub sequence_errors: u32,
    pub lost: u32,
    pub out_of_order: u32,
    pub duplicate: u32,
    pub delay_var_sum_usec: i64,
    pub delay_var_samples: u32,
    pub delay_var_min_usec: u32,
    pub delay_var_max_usec: u32,
    pub rtt_min_usec: u32,
    pub rtt_max_usec: u32,
    /// Wall-clock bounds of this sub-interval: `t_start_usec` is stamped on
    /// the first connection sample folded in, `t_end_usec` on close.
    pub t_start_usec: i64,
    pub t_end_usec: i64,
}

impl Default for GroupSubInterval {
    fn default() -> Self {
        GroupSubInterval {
            index: 0,
            connections_reporting: 0,
            datagrams_received: 0,
            bytes_received: 0,
            sequence_errors: 0,
            lost: 0,
            out_of_order: 0,
            duplicate: 0,
            delay_var_sum_usec: 0,
            delay_var_samples: 0,
            delay_var_min_usec: STATUS_NODEL,
            delay_var_max_usec: STATUS_NODEL,
            rtt_min_usec: STATUS_NODEL,
            rtt_max_usec: STATUS_NODEL,
            t_start_usec: 0,
            t_end_usec: 0,
        }
    }
}

impl GroupSubInterval {
    pub fn mean_delay_var_usec(&self) -> i32 {
        if self.delay_var_samples == 0 {
            0
        } else {
            (self.delay_var_sum_usec / self.delay_var_samples as i64) as i32
        }
    }

    pub fn bps(&self, period_ms: u32) -> f64 {
        if period_ms == 0 {
            0.0
        } else {
            self.bytes_received as f64 * 8.0 * 1000.0 / period_ms as f64
        }
    }

    fn ratio(&self, count: u32) -> f64 {
        let expected = self.datagrams_received + self.lost as u64;
        if expected == 0 {
            0.0
        } else {
            count as f64 / expected as f64
        }
    }

    /// `lossRatio ∈ [0,1]` (spec.md §4.8, §8).
    pub fn loss_ratio(&self) -> f64 {
        self.ratio(self.lost)
    }

    pub fn ooo_ratio(&self) -> f64 {
        self.ratio(self.out_of_order)
    }

    pub fn dup_ratio(&self) -> f64 {
        self.ratio(self.duplicate)
    }
}

/// Accumulates per-connection `SubIntervalStats` into `GroupSubInterval`s
/// over the life of a multi-connection test, splitting the first
/// `bimodal_count` sub-intervals out as individually reported phases.
pub struct Aggregator {
    bimodal_count: u32,
    next_index: u32,
    /// Reported individually, one entry per connection per sub-interval,
    /// for as long as `next_index < bimodal_count`.
    pub bimodal_phase: Vec<(u32, SubIntervalStats)>,
    pub steady_phase: Vec<GroupSubInterval>,
    current: GroupSubInterval,
}

impl Aggregator {
    pub fn new(bimodal_count: u32) -> Self {
        Aggregator {
            bimodal_count,
            next_index: 0,
            bimodal_phase: Vec::new(),
            steady_phase: Vec::new(),
            current: GroupSubInterval { index: 0, ..Default::default() },
        }
    }

    /// Fold one connection's closed sub-interval into the current rollup.
    pub fn add_connection_sample(&mut self, conn_id: u32, stats: SubIntervalStats) {
        if self.next_index < self.bimodal_count {
            self.bimodal_phase.push((conn_id, stats));
            return;
        }
        if self.current.t_start_usec == 0 {
            self.current.t_start_usec = now_usec();
        }
        self.current.connections_reporting += 1;
        self.current.datagrams_received += stats.datagrams_received;
        self.current.bytes_received += stats.bytes_received;
        self.current.sequence_errors += stats.sequence_errors;
        self.current.lost += stats.lost;
        self.current.out_of_order += stats.out_of_order;
        self.current.duplicate += stats.duplicate;
        self.current.delay_var_sum_usec += stats.delay_var_sum_usec;
        self.current.delay_var_samples += stats.delay_var_samples;
        fold_range(
            &mut self.current.delay_var_min_usec,
            &mut self.current.delay_var_max_usec,
            stats.delay_var_min_usec,
            stats.delay_var_max_usec,
        );
        fold_range(
            &mut self.current.rtt_min_usec,
            &mut self.current.rtt_max_usec,
            stats.rtt_min_usec,
            stats.rtt_max_usec,
        );
    }

    /// Close out the current group sub-interval (every connection in the
    /// group has reported) and start the next one.
    pub fn close_sub_interval(&mut self) {
        if self.next_index >= self.bimodal_count {
            self.current.t_end_usec = now_usec();
            let closed = std::mem::replace(
                &mut self.current,
                GroupSubInterval { index: self.next_index + 1, ..Default::default() },
            );
            self.steady_phase.push(closed);
        }
        self.next_index += 1;
    }

    pub fn is_in_bimodal_phase(&self) -> bool {
        self.next_index < self.bimodal_count
    }
}

/// End-of-test summary across the whole steady-phase history, plus the raw
/// bimodal preamble for callers that want to inspect ramp-up behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSummary {
    pub sub_intervals: u32,
    pub total_datagrams: u64,
    pub total_bytes: u64,
    pub total_sequence_errors: u32,
    pub total_lost: u32,
    pub total_out_of_order: u32,
    pub total_duplicate: u32,
    pub mean_delay_var_usec: i32,
    /// All-time minima/maxima across every steady-phase sub-interval
    /// (spec.md §4.8: "the aggregator also maintains all-time minima").
    pub delay_var_min_usec: u32,
    pub delay_var_max_usec: u32,
    pub rtt_min_usec: u32,
    pub rtt_max_usec: u32,
    /// Decode-time drops accumulated over the connection's lifetime
    /// (spec.md §7), folded in once the data phase ends.
    pub perf_stats: PerfStatsCounters,
}

impl Default for TestSummary {
    fn default() -> Self {
        TestSummary {
            sub_intervals: 0,
            total_datagrams: 0,
            total_bytes: 0,
            total_sequence_errors: 0,
            total_lost: 0,
            total_out_of_order: 0,
            total_duplicate: 0,
            mean_delay_var_usec: 0,
            delay_var_min_usec: STATUS_NODEL,
            delay_var_max_usec: STATUS_NODEL,
            rtt_min_usec: STATUS_NODEL,
            rtt_max_usec: STATUS_NODEL,
            perf_stats: PerfStatsCounters::default(),
        }
    }
}

pub fn summarize(steady_phase: &[GroupSubInterval]) -> TestSummary {
    let mut summary = TestSummary::default();
    let mut delay_sum: i64 = 0;
    let mut delay_samples: u32 = 0;
    for s in steady_phase {
        summary.sub_intervals += 1;
        summary.total_datagrams += s.datagrams_received;
        summary.total_bytes += s.bytes_received;
        summary.total_sequence_errors += s.sequence_errors;
        summary.total_lost += s.lost;
        summary.total_out_of_order += s.out_of_order;
        summary.total_duplicate += s.duplicate;
        delay_sum += s.delay_var_sum_usec;
        delay_samples += s.delay_var_samples;
        fold_range(&mut summary.delay_var_min_usec, &mut summary.delay_var_max_usec, s.delay_var_min_usec, s.delay_var_max_usec);
        fold_range(&mut summary.rtt_min_usec, &mut summary.rtt_max_usec, s.rtt_min_usec, s.rtt_max_usec);
    }
    summary.mean_delay_var_usec = if delay_samples == 0 {
        0
    } else {
        (delay_sum / delay_samples as i64) as i32
    };
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(datagrams: u64, bytes: u64, delay: i64) -> SubIntervalStats {
        SubIntervalStats {
            datagrams_received: datagrams,
            bytes_received: bytes,
            sequence_errors: 0,
            lost: 0,
            out_of_order: 0,
            duplicate: 0,
            delay_var_sum_usec: delay,
            delay_var_samples: if datagrams > 0 { 1 } else { 0 },
            ..Default::default()
        }
    }

    #[test]
    fn bimodal_preamble_reported_individually() {
        let mut agg = Aggregator::new(2);
        agg.add_connection_sample(0, stats(10, 1000, 5));
        agg.close_sub_interval();
        agg.add_connection_sample(0, stats(10, 1000, 5));
        agg.close_sub_interval();
        assert_eq!(agg.bimodal_phase.len(), 2);
        assert!(agg.steady_phase.is_empty());
    }

    #[test]
    fn steady_phase_rolls_up_after_bimodal_preamble() {
        let mut agg = Aggregator::new(1);
        agg.add_connection_sample(0, stats(10, 1000, 5));
        agg.close_sub_interval();
        assert!(agg.is_in_bimodal_phase() == false);
        agg.add_connection_sample(0, stats(20, 2000, 10));
        agg.add_connection_sample(1, stats(20, 2000, 10));
        agg.close_sub_interval();
        assert_eq!(agg.steady_phase.len(), 1);
        assert_eq!(agg.steady_phase[0].connections_reporting, 2);
        assert_eq!(agg.steady_phase[0].datagrams_received, 40);
    }

    #[test]
    fn summarize_aggregates_across_sub_intervals() {
        let steady = vec![
            GroupSubInterval { datagrams_received: 10, bytes_received: 1000, delay_var_sum_usec: 100, delay_var_samples: 10, ..Default::default() },
            GroupSubInterval { datagrams_received: 20, bytes_received: 2000, delay_var_sum_usec: 200, delay_var_samples: 10, ..Default::default() },
        ];
        let summary = summarize(&steady);
        assert_eq!(summary.sub_intervals, 2);
        assert_eq!(summary.total_datagrams, 30);
        assert_eq!(summary.total_bytes, 3000);
        assert_eq!(summary.mean_delay_var_usec, 15);
    }

    #[test]
    fn bps_computes_bits_per_second_from_bytes_and_period() {
        let g = GroupSubInterval { bytes_received: 125_000, ..Default::default() };
        assert_eq!(g.bps(1000), 1_000_000.0);
    }

    #[test]
    fn loss_ratio_is_zero_when_nothing_expected() {
        let g = GroupSubInterval::default();
        assert_eq!(g.loss_ratio(), 0.0);
    }

    #[test]
    fn loss_ratio_divides_lost_by_expected() {
        let g = GroupSubInterval { datagrams_received: 90, lost: 10, ..Default::default() };
        assert_eq!(g.loss_ratio(), 0.1);
    }

    #[test]
    fn connection_delay_var_and_rtt_ranges_roll_up_as_min_of_mins_max_of_maxes() {
        let mut agg = Aggregator::new(0);
        let mut a = stats(10, 1000, 50);
        a.delay_var_min_usec = 20;
        a.delay_var_max_usec = 80;
        a.rtt_min_usec = 1000;
        a.rtt_max_usec = 2000;
        agg.add_connection_sample(0, a);

        let mut b = stats(10, 1000, 50);
        b.delay_var_min_usec = 5;
        b.delay_var_max_usec = 60;
        b.rtt_min_usec = 1500;
        b.rtt_max_usec = 3000;
        agg.add_connection_sample(1, b);

        agg.close_sub_interval();
        let row = &agg.steady_phase[0];
        assert_eq!(row.delay_var_min_usec, 5);
        assert_eq!(row.delay_var_max_usec, 80);
        assert_eq!(row.rtt_min_usec, 1000);
        assert_eq!(row.rtt_max_usec, 3000);
    }

    #[test]
    fn connection_sample_with_no_rtt_data_does_not_poison_the_rollup() {
        let mut agg = Aggregator::new(0);
        let mut a = stats(10, 1000, 50);
        a.rtt_min_usec = 1000;
        a.rtt_max_usec = 2000;
        agg.add_connection_sample(0, a);

        // Second connection reports no RTT sample yet this sub-interval.
        let b = stats(10, 1000, 50);
        agg.add_connection_sample(1, b);

        agg.close_sub_interval();
        let row = &agg.steady_phase[0];
        assert_eq!(row.rtt_min_usec, 1000, "a STATUS_NODEL connection sample must not erase a real one");
        assert_eq!(row.rtt_max_usec, 2000);
    }

    #[test]
    fn summarize_tracks_all_time_delay_var_and_rtt_extremes() {
        let mut first = GroupSubInterval { datagrams_received: 10, bytes_received: 1000, delay_var_sum_usec: 100, delay_var_samples: 10, ..Default::default() };
        first.delay_var_min_usec = 10;
        first.delay_var_max_usec = 40;
        first.rtt_min_usec = 500;
        first.rtt_max_usec = 900;
        let mut second = GroupSubInterval { datagrams_received: 20, bytes_received: 2000, delay_var_sum_usec: 200, delay_var_samples: 10, ..Default::default() };
        second.delay_var_min_usec = 5;
        second.delay_var_max_usec = 60;
        second.rtt_min_usec = 400;
        second.rtt_max_usec = 1200;

        let summary = summarize(&[first, second]);
        assert_eq!(summary.delay_var_min_usec, 5);
        assert_eq!(summary.delay_var_max_usec, 60);
        assert_eq!(summary.rtt_min_usec, 400);
        assert_eq!(summary.rtt_max_usec, 1200);
    }
}
