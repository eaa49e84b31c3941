//! The indexed sending-rate table: every row the rate controller can walk
//! the connection's send parameters to.
//!
//! Row `i+1` always sends at least as fast as row `i` — `net::rate` relies on
//! this monotonicity to reason about "step up"/"step down" as index
//! increments/decrements.

/// Set when a row's payload should be filled with randomized bytes rather
/// than zeros, mirroring the reference table's "max payload" flag. Per the
/// Open Question in spec.md §9, this crate applies the bit to the payload
/// field only — burst size is unaffected.
pub const SRATE_RAND_BIT: u8 = 0x01;

/// One row of the sending-rate table: the two-train parameters a connection
/// sends at when its rate index points here (spec.md §3 SendingRate, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendingRate {
    /// Train 1 inter-datagram interval, microseconds.
    pub tx_interval1_usec: u32,
    /// Train 1 payload size, bytes.
    pub udp_payload1: u32,
    /// Train 1 burst size, datagrams.
    pub burst_size1: u32,
    /// Train 2 inter-datagram interval, microseconds (0 if single-train).
    pub tx_interval2_usec: u32,
    /// Train 2 payload size, bytes.
    pub udp_payload2: u32,
    /// Train 2 burst size, datagrams.
    pub burst_size2: u32,
    /// Extra datagrams appended to train 2's burst to correct rounding
    /// error in the achieved bps versus the nominal rate for this row.
    pub udp_addon2: u32,
    pub flags: u8,
}

impl SendingRate {
    pub fn randomize_payload(&self) -> bool {
        self.flags & SRATE_RAND_BIT != 0
    }

    /// Nominal bits-per-second this row targets, summing both trains.
    pub fn nominal_bps(&self) -> f64 {
        let train1 = if self.tx_interval1_usec > 0 {
            (self.udp_payload1 as f64) * 8.0 * 1_000_000.0 / (self.tx_interval1_usec as f64)
        } else {
            0.0
        };
        let train2 = if self.tx_interval2_usec > 0 {
            (self.udp_payload2 as f64) * 8.0 * 1_000_000.0 / (self.tx_interval2_usec as f64)
        } else {
            0.0
        };
        train1 + train2
    }
}

/// Number of rows in the generated table. The reference table
/// (`udpst_srates`/`udpst_srates_alt2`) is not present in the retrieved
/// source, so this crate generates a table with the same shape
/// (monotonically increasing nominal rate, geometric-ish growth at the low
/// end flattening into linear growth at the high end) rather than
/// transcribing it (documented as a reconstruction in DESIGN.md).
pub const MAX_SENDING_RATES: usize = 460;

/// Smallest payload a row may carry; below this the per-datagram header
/// overhead dominates the achieved rate.
const MIN_PAYLOAD: u32 = 50;
/// Largest payload a row may carry without IP fragmentation on a
/// traditional (1500-byte) MTU path.
const MAX_PAYLOAD_TRADITIONAL: u32 = 1430;

/// Build the full sending-rate table, indexed 0..MAX_SENDING_RATES.
///
/// Row 0 is the slowest (smallest payload, longest interval); the final row
/// approaches the link's practical ceiling for a traditional MTU. Rates grow
/// roughly geometrically through the low third, then the payload saturates
/// at `MAX_PAYLOAD_TRADITIONAL` and further growth comes from shortening the
/// interval, giving the flattening-then-linear shape callers expect from
/// `nominal_bps` when walking the table by index.
pub fn build_table() -> Vec<SendingRate> {
    let mut table = Vec::with_capacity(MAX_SENDING_RATES);
    for i in 0..MAX_SENDING_RATES {
        let frac = i as f64 / (MAX_SENDING_RATES - 1) as f64;
        let payload = (MIN_PAYLOAD as f64
            + (MAX_PAYLOAD_TRADITIONAL - MIN_PAYLOAD) as f64 * frac.min(0.4) / 0.4)
            .min(MAX_PAYLOAD_TRADITIONAL as f64) as u32;
        // Target bps grows geometrically from ~64kbps to ~10gbps across the table.
        let target_bps = 64_000.0 * (10_000_000_000.0f64 / 64_000.0).powf(frac);
        let interval_usec = ((payload as f64) * 8.0 * 1_000_000.0 / target_bps)
            .round()
            .max(1.0) as u32;
        table.push(SendingRate {
            tx_interval1_usec: interval_usec,
            udp_payload1: payload,
            burst_size1: 1,
            tx_interval2_usec: 0,
            udp_payload2: 0,
            burst_size2: 0,
            udp_addon2: 0,
            flags: 0,
        });
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_expected_length() {
        assert_eq!(build_table().len(), MAX_SENDING_RATES);
    }

    #[test]
    fn nominal_bps_is_monotonically_nondecreasing() {
        let table = build_table();
        for w in table.windows(2) {
            assert!(
                w[1].nominal_bps() >= w[0].nominal_bps() - 1.0,
                "rate decreased between adjacent rows: {} -> {}",
                w[0].nominal_bps(),
                w[1].nominal_bps()
            );
        }
    }

    #[test]
    fn payloads_never_exceed_traditional_mtu_budget() {
        for row in build_table() {
            assert!(row.udp_payload1 <= MAX_PAYLOAD_TRADITIONAL);
        }
    }

    #[test]
    fn rand_bit_toggles_payload_randomization_only() {
        let mut row = SendingRate {
            tx_interval1_usec: 100,
            udp_payload1: 100,
            burst_size1: 1,
            tx_interval2_usec: 0,
            udp_payload2: 0,
            burst_size2: 0,
            udp_addon2: 0,
            flags: 0,
        };
        assert!(!row.randomize_payload());
        row.flags |= SRATE_RAND_BIT;
        assert!(row.randomize_payload());
    }
}
