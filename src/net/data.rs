//! Data-plane state machine: the two-train sender and the receiver's
//! delay-variation/loss classification and sub-interval accumulation
//! (spec.md §4.5, C5).

use std::collections::VecDeque;

use crate::net::codec::LoadPdu;
use crate::net::srate::SendingRate;
use crate::time::Deadline;

/// Caps a catch-up burst (after a scheduling stall) so a single tick cannot
/// flood the socket trying to make up lost ground (spec.md §4.5).
pub const MAX_BURST_SIZE: u32 = 64;

/// Per-train send schedule state, one per train (1 and 2) of a row.
#[derive(Debug, Clone, Copy)]
struct TrainSchedule {
    interval_usec: u32,
    payload: u32,
    burst: u32,
    addon: u32,
    next_due: Deadline,
    seq_no: u32,
}

impl TrainSchedule {
    fn new(interval_usec: u32, payload: u32, burst: u32, addon: u32, now: Deadline) -> Self {
        TrainSchedule { interval_usec, payload, burst, addon, next_due: now, seq_no: 0 }
    }
}

/// Drives the two-train sending schedule for one connection's data phase.
/// Deadlines advance as `prev + interval`, never `now + interval`, so a
/// delayed tick does not permanently shift the long-run average rate
/// (spec.md §4.5).
pub struct Sender {
    conn_id: u32,
    train1: TrainSchedule,
    train2: Option<TrainSchedule>,
    rand_payload: bool,
}

impl Sender {
    pub fn new(conn_id: u32, row: &SendingRate, now: Deadline) -> Self {
        let train1 = TrainSchedule::new(row.tx_interval1_usec, row.udp_payload1, row.burst_size1, 0, now);
        let train2 = if row.tx_interval2_usec > 0 {
            Some(TrainSchedule::new(
                row.tx_interval2_usec,
                row.udp_payload2,
                row.burst_size2,
                row.udp_addon2,
                now,
            ))
        } else {
            None
        };
        Sender { conn_id, train1, train2, rand_payload: row.randomize_payload() }
    }

    /// Reconfigure for a new sending-rate row after the rate controller
    /// steps the index, preserving sequence numbers but resetting deadlines
    /// to `now` so the new rate takes effect immediately.
    pub fn retune(&mut self, row: &SendingRate, now: Deadline) {
        let seq1 = self.train1.seq_no;
        self.train1 = TrainSchedule::new(row.tx_interval1_usec, row.udp_payload1, row.burst_size1, 0, now);
        self.train1.seq_no = seq1;
        self.train2 = if row.tx_interval2_usec > 0 {
            let seq2 = self.train2.as_ref().map(|t| t.seq_no).unwrap_or(0);
            let mut t = TrainSchedule::new(
                row.tx_interval2_usec,
                row.udp_payload2,
                row.burst_size2,
                row.udp_addon2,
                now,
            );
            t.seq_no = seq2;
            Some(t)
        } else {
            None
        };
        self.rand_payload = row.randomize_payload();
    }

    /// Produce the datagrams due to be sent as of `now`, advancing each
    /// train's schedule by whole intervals and capping the catch-up burst
    /// at `MAX_BURST_SIZE` per train per call.
    pub fn due_datagrams(&mut self, now: Deadline, send_time: (u32, u32)) -> Vec<LoadPdu> {
        let mut out = Vec::new();
        Self::drain_train(&mut self.train1, 1, self.conn_id, now, send_time, self.rand_payload, &mut out);
        if let Some(train2) = &mut self.train2 {
            Self::drain_train(train2, 2, self.conn_id, now, send_time, self.rand_payload, &mut out);
        }
        out
    }

    fn drain_train(
        train: &mut TrainSchedule,
        train_no: u8,
        conn_id: u32,
        now: Deadline,
        send_time: (u32, u32),
        rand_payload: bool,
        out: &mut Vec<LoadPdu>,
    ) {
        if train.interval_usec == 0 {
            return;
        }
        let mut sent_this_call = 0;
        while train.next_due.has_elapsed(now.instant()) && sent_this_call < MAX_BURST_SIZE {
            for _ in 0..train.burst.max(1) {
                if sent_this_call >= MAX_BURST_SIZE {
                    break;
                }
                let mut payload_len = train.payload as usize;
                if train_no == 2 {
                    payload_len += train.addon as usize;
                }
                let payload = if rand_payload {
                    (0..payload_len).map(|i| (i as u8).wrapping_mul(31)).collect()
                } else {
                    vec![0u8; payload_len]
                };
                out.push(LoadPdu {
                    conn_id,
                    seq_no: train.seq_no,
                    send_time_secs: send_time.0,
                    send_time_nanos: send_time.1,
                    train: train_no,
                    spacing_usec: train.interval_usec,
                    // Session/RTT-echo fields are control-plane state this
                    // layer doesn't track; the caller stamps them before
                    // the datagram goes out (see repository::run_sender_side).
                    test_action: 0,
                    rx_stopped: false,
                    payload_size: payload_len as u32,
                    spdu_seq_err: 0,
                    rtt_tx_time_secs: 0,
                    rtt_tx_time_nanos: 0,
                    rtt_rx_time_secs: 0,
                    rtt_rx_time_nanos: 0,
                    payload,
                });
                train.seq_no = train.seq_no.wrapping_add(1);
                sent_this_call += 1;
            }
            train.next_due = train.next_due.plus(std::time::Duration::from_micros(train.interval_usec as u64));
        }
    }
}

/// Sentinel for "no data" on a min/max field, matching the reference's
/// `STATUS_NODEL` (`UINT32_MAX`): a field holds it until the first real
/// sample arrives.
pub const STATUS_NODEL: u32 = u32::MAX;

/// Per-sub-interval accumulation on the receiving side (spec.md §3
/// Sub-interval stats, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubIntervalStats {
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
    /// RTT is only sampled once a Status-PDU echo has round-tripped; both
    /// stay `STATUS_NODEL` until that happens (spec.md §4.5, §8: "rttMin
    /// <= rttMax whenever rttMax != STATUS_NODEL").
    pub rtt_min_usec: u32,
    pub rtt_max_usec: u32,
}

impl Default for SubIntervalStats {
    fn default() -> Self {
        SubIntervalStats {
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
        }
    }
}

impl SubIntervalStats {
    pub fn mean_delay_var_usec(&self) -> i32 {
        if self.delay_var_samples == 0 {
            0
        } else {
            (self.delay_var_sum_usec / self.delay_var_samples as i64) as i32
        }
    }
}

/// Fold one `u32` sample into a running min/max pair, treating
/// `STATUS_NODEL` as "no value yet" rather than a real sample.
pub(crate) fn fold_min_max(min: &mut u32, max: &mut u32, sample: u32) {
    if *min == STATUS_NODEL || sample < *min {
        *min = sample;
    }
    if *max == STATUS_NODEL || sample > *max {
        *max = sample;
    }
}

/// Fold one already-aggregated min/max range into another, same
/// `STATUS_NODEL`-means-absent rule, used when rolling up across
/// connections ("picking the min of mins and max of maxes", spec.md §4.8).
pub(crate) fn fold_range(min: &mut u32, max: &mut u32, sample_min: u32, sample_max: u32) {
    if sample_min != STATUS_NODEL && (*min == STATUS_NODEL || sample_min < *min) {
        *min = sample_min;
    }
    if sample_max != STATUS_NODEL && (*max == STATUS_NODEL || sample_max > *max) {
        *max = sample_max;
    }
}

/// How one received datagram compared to the receiver's expected sequence
/// (spec.md §4.5's seq/loss/OoO/dup classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    InOrder,
    OutOfOrder,
    Duplicate,
    Lost(u32),
}

/// Tracks per-train expected sequence numbers and recent-history window for
/// out-of-order/duplicate detection, plus the running sub-interval
/// accumulator.
pub struct Receiver {
    expected_seq: u32,
    /// Recently seen sequence numbers, bounded, for duplicate/very-late
    /// out-of-order detection once a gap has already been counted as loss.
    recent: VecDeque<u32>,
    recent_cap: usize,
    pub current: SubIntervalStats,
    ignore_ooo_dup: bool,
}

impl Receiver {
    pub fn new(ignore_ooo_dup: bool) -> Self {
        Receiver {
            expected_seq: 0,
            recent: VecDeque::new(),
            recent_cap: 256,
            current: SubIntervalStats::default(),
            ignore_ooo_dup,
        }
    }

    fn remember(&mut self, seq: u32) {
        if self.recent.len() >= self.recent_cap {
            self.recent.pop_front();
        }
        self.recent.push_back(seq);
    }

    fn seen_recently(&self, seq: u32) -> bool {
        self.recent.contains(&seq)
    }

    /// Classify and fold in one inbound datagram's sequence number against
    /// `expected_seq`. `rtt_usec` is `None` until the first Status-PDU echo
    /// has round-tripped back to this side.
    pub fn on_datagram(
        &mut self,
        seq: u32,
        delay_var_usec: i32,
        payload_len: usize,
        rtt_usec: Option<i64>,
    ) -> SequenceOutcome {
        let outcome = if seq == self.expected_seq {
            self.expected_seq = self.expected_seq.wrapping_add(1);
            SequenceOutcome::InOrder
        } else if self.seen_recently(seq) {
            SequenceOutcome::Duplicate
        } else if seq > self.expected_seq {
            let gap = seq - self.expected_seq;
            self.expected_seq = seq.wrapping_add(1);
            SequenceOutcome::Lost(gap)
        } else {
            SequenceOutcome::OutOfOrder
        };
        self.remember(seq);

        self.current.datagrams_received += 1;
        self.current.bytes_received += payload_len as u64;
        self.current.delay_var_sum_usec += delay_var_usec as i64;
        self.current.delay_var_samples += 1;
        fold_min_max(
            &mut self.current.delay_var_min_usec,
            &mut self.current.delay_var_max_usec,
            delay_var_usec.max(0) as u32,
        );
        if let Some(rtt) = rtt_usec {
            fold_min_max(&mut self.current.rtt_min_usec, &mut self.current.rtt_max_usec, rtt.max(0) as u32);
        }

        match outcome {
            // Loss is never exempted by ignoreOooDup (spec.md §4.5): only
            // OutOfOrder/Duplicate are, since those two are reordering
            // artifacts rather than genuine drops.
            SequenceOutcome::Lost(gap) => {
                self.current.lost += gap;
                self.current.sequence_errors += 1;
            }
            SequenceOutcome::OutOfOrder => {
                self.current.out_of_order += 1;
                if !self.ignore_ooo_dup {
                    self.current.sequence_errors += 1;
                }
            }
            SequenceOutcome::Duplicate => {
                self.current.duplicate += 1;
                if !self.ignore_ooo_dup {
                    self.current.sequence_errors += 1;
                }
            }
            SequenceOutcome::InOrder => {}
        }
        outcome
    }

    /// Snapshot and reset the sub-interval accumulator, e.g. when a Status
    /// PDU is about to be emitted.
    pub fn take_sub_interval(&mut self) -> SubIntervalStats {
        std::mem::take(&mut self.current)
    }
}
