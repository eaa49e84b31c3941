//! Negotiated test parameters and server policy.
//!
//! These structs are the *settled* configuration surface: whatever fills
//! them in — a config file, an embedding application's own flag parser — is
//! out of scope (spec.md §1 Non-goals). `TestConfig` is what the client
//! proposes in CHTA; `ServerConfig` is the server-side policy CHTA requests
//! are policed against (spec.md §4.4).

use serde::{Deserialize, Serialize};

use crate::net::rate::RateAdjAlgo;

/// Client-proposed (and, after negotiation, server-adjusted) test parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestConfig {
    /// Lower delay-variation threshold (ms) — below this, the link is under-utilised.
    pub low_thresh_ms: u32,
    /// Upper delay-variation threshold (ms) — at/above this, the link is congested.
    pub upper_thresh_ms: u32,
    /// Feedback cadence (ms); spec.md's "trialInt".
    pub trial_interval_ms: u32,
    /// Total test duration (s).
    pub test_interval_time_s: u32,
    /// Reporting cadence (ms); spec.md's "subIntPeriod".
    pub sub_interval_period_ms: u32,
    /// DSCP+ECN byte applied to the test socket.
    pub dscp_ecn: u8,
    /// Starting sending-rate row, if `sr_index_is_start` or fixed-rate mode.
    pub sr_index_conf: Option<u16>,
    /// Whether `sr_index_conf` is merely a starting point (true) or a fixed,
    /// non-adapting rate (false).
    pub sr_index_is_start: bool,
    /// Use one-way delay variation (requires synced clocks) instead of RTT-derived.
    pub use_ow_del_var: bool,
    /// Index step once above `hSpeedThresh`.
    pub high_speed_delta: u16,
    /// Consecutive-congested-trial threshold before Algorithm B halves its step,
    /// and the dwell length for Algorithm C.
    pub slow_adj_thresh: u32,
    /// Sequence-error count per trial that classifies a trial as congested.
    pub seq_err_thresh: u32,
    /// When set, out-of-order/duplicate datagrams do not count as loss.
    pub ignore_ooo_dup: bool,
    /// Randomize payload bytes instead of sending zeros.
    pub rand_payload: bool,
    pub rate_adj_algo: RateAdjAlgo,
    /// Mbps cap for this test; 0 = unbounded.
    pub max_bandwidth_mbps: u32,
    /// Sub-intervals in the deterministic preamble; 0 = disabled.
    pub bimodal_count: u32,
    pub upstream: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            low_thresh_ms: 5,
            upper_thresh_ms: 10,
            trial_interval_ms: 100,
            test_interval_time_s: 10,
            sub_interval_period_ms: 1000,
            dscp_ecn: 0,
            sr_index_conf: None,
            sr_index_is_start: true,
            use_ow_del_var: false,
            high_speed_delta: 4,
            slow_adj_thresh: 4,
            seq_err_thresh: 1,
            ignore_ooo_dup: false,
            rand_payload: false,
            rate_adj_algo: RateAdjAlgo::B,
            max_bandwidth_mbps: 0,
            bimodal_count: 0,
            upstream: false,
        }
    }
}

/// Server-side policy: the bounds CHTA requests are clamped against
/// (spec.md §4.4, §8 "Server clamps... never raises").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_test_interval_time_s: u32,
    pub max_dscp_ecn: u8,
    pub allow_rand_payload: bool,
    /// Total Mbps budget shared across upstream+downstream; 0 = unbounded.
    pub max_bandwidth_mbps: u32,
    pub send_buffer_bytes: Option<usize>,
    pub recv_buffer_bytes: Option<usize>,
    pub v6only: bool,
    pub require_auth: bool,
    /// Shared key used to derive per-session HMAC keys, when present.
    pub shared_key: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_connections: 128,
            max_test_interval_time_s: 3600,
            max_dscp_ecn: 0xFF,
            allow_rand_payload: true,
            max_bandwidth_mbps: 0,
            send_buffer_bytes: None,
            recv_buffer_bytes: None,
            v6only: false,
            require_auth: false,
            shared_key: None,
        }
    }
}

impl ServerConfig {
    /// Clamp a client-proposed `TestConfig` to this server's policy. Invalid
    /// relationships (low > upper) reset both to the supplied defaults
    /// rather than rejecting outright, per spec.md §4.4.
    pub fn clamp(&self, mut proposed: TestConfig, defaults: &TestConfig) -> TestConfig {
        if proposed.low_thresh_ms > proposed.upper_thresh_ms {
            proposed.low_thresh_ms = defaults.low_thresh_ms;
            proposed.upper_thresh_ms = defaults.upper_thresh_ms;
        }
        if proposed.test_interval_time_s > self.max_test_interval_time_s {
            proposed.test_interval_time_s = self.max_test_interval_time_s;
        }
        if proposed.dscp_ecn > self.max_dscp_ecn {
            proposed.dscp_ecn = self.max_dscp_ecn;
        }
        if proposed.rand_payload && !self.allow_rand_payload {
            proposed.rand_payload = false;
        }
        proposed
    }

    /// Load server policy from a TOML file. The file format, not the CLI
    /// that might point at it, is in scope here.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_resets_inverted_thresholds_to_defaults() {
        let server = ServerConfig::default();
        let defaults = TestConfig::default();
        let mut proposed = TestConfig::default();
        proposed.low_thresh_ms = 50;
        proposed.upper_thresh_ms = 10;

        let clamped = server.clamp(proposed, &defaults);
        assert_eq!(clamped.low_thresh_ms, defaults.low_thresh_ms);
        assert_eq!(clamped.upper_thresh_ms, defaults.upper_thresh_ms);
    }

    #[test]
    fn clamp_never_raises_test_interval() {
        let mut server = ServerConfig::default();
        server.max_test_interval_time_s = 60;
        let defaults = TestConfig::default();
        let mut proposed = TestConfig::default();
        proposed.test_interval_time_s = 9999;

        let clamped = server.clamp(proposed, &defaults);
        assert_eq!(clamped.test_interval_time_s, 60);
    }

    #[test]
    fn clamp_rejects_rand_payload_when_server_disallows() {
        let mut server = ServerConfig::default();
        server.allow_rand_payload = false;
        let defaults = TestConfig::default();
        let mut proposed = TestConfig::default();
        proposed.rand_payload = true;

        let clamped = server.clamp(proposed, &defaults);
        assert!(!clamped.rand_payload);
    }
}
