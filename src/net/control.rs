//! Control-plane state machine: the CHSR/CHNR/CHTA handshake sequence and
//! the server-side policing chain applied to each request (spec.md §4.4,
//! C4).

use std::net::SocketAddr;

use bytes::BytesMut;
use tracing::{info, warn};

use crate::config::{ServerConfig, TestConfig};
use crate::error::{AuthError, ProtocolError, UdpstError};
use crate::net::auth::{validate_auth, AuthMode};
use crate::net::codec::{AuthTail, ChsrRequest, ChsrResponse, ChtaRequest, ChtaResponse};
use crate::net::protocol::{CrspCode, PROTOCOL_MIN, PROTOCOL_VER};
use crate::net::rate::{RateController, StartMode};

/// Where a connection sits in the handshake/test lifecycle (spec.md §4.4's
/// `testAction` state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAction {
    Idle,
    Test,
    Stop1,
    Stop2,
}

impl TestAction {
    /// Encode for the Load/Status PDU `testAction` field.
    pub fn as_wire(self) -> u8 {
        match self {
            TestAction::Idle => 0,
            TestAction::Test => 1,
            TestAction::Stop1 => 2,
            TestAction::Stop2 => 3,
        }
    }

    /// Decode a `testAction` wire value. Unrecognized values fall back to
    /// `Idle` rather than rejecting the datagram outright.
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => TestAction::Test,
            2 => TestAction::Stop1,
            3 => TestAction::Stop2,
            _ => TestAction::Idle,
        }
    }
}

/// Client-side driver for one session: issues CHSR, optionally CHNR, then
/// CHTA, tracking `testAction` as responses arrive.
pub struct Session {
    pub state: TestAction,
    pub conn_id: Option<u32>,
}

impl Session {
    pub fn new() -> Self {
        Session { state: TestAction::Idle, conn_id: None }
    }

    pub fn start(&mut self, conn_id: u32) {
        self.conn_id = Some(conn_id);
        self.state = TestAction::Test;
        info!(conn_id, "test session started");
    }

    /// Begin the two-phase stop sequence (spec.md's Stop1/Stop2): Stop1
    /// requests a graceful drain, Stop2 is the forced teardown once the
    /// drain window elapses or the peer acknowledges.
    pub fn stop_test(&mut self) {
        self.state = match self.state {
            TestAction::Test => TestAction::Stop1,
            TestAction::Stop1 => TestAction::Stop2,
            other => other,
        };
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TestAction::Test | TestAction::Stop1)
    }

    /// Mirror a peer's `testAction` onto local state: if the peer has
    /// already moved to Stop1/Stop2 and we haven't, follow it into Stop1
    /// so our own next outgoing PDU carries the same signal (spec.md §8
    /// scenario 6 — the receiver echoes the sender's Stop1).
    pub fn observe_peer(&mut self, peer: TestAction) {
        if matches!(peer, TestAction::Stop1 | TestAction::Stop2) && self.state == TestAction::Test {
            self.state = TestAction::Stop1;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of policing one CHSR request against server policy.
pub struct ChsrDecision {
    pub crsp: CrspCode,
    pub conn_id: Option<u32>,
}

/// Server-side CHSR validation chain: version range, auth requirements,
/// multi-connection parameters, then connection-table admission (spec.md
/// §4.4). Returns the response to send; never panics on malformed input —
/// auth/version failures are ordinary `CrspCode` outcomes, not propagated
/// errors.
pub fn police_chsr(
    req: &ChsrRequest,
    server: &ServerConfig,
    shared_key: Option<&[u8]>,
) -> Result<CrspCode, ProtocolError> {
    if req.protocol_ver < PROTOCOL_MIN || req.protocol_ver > PROTOCOL_VER {
        return Ok(CrspCode::BadVer);
    }
    if req.mc_count > 0 && req.mc_index >= req.mc_count {
        return Err(ProtocolError::InvalidMcParams);
    }

    let mode = AuthMode::from_u8(req.auth.auth_mode).unwrap_or(AuthMode::None);
    if let Some(key) = shared_key {
        let mut zeroed = req.clone();
        zeroed.auth.auth_digest = [0u8; 32];
        let mut buf = BytesMut::new();
        zeroed.encode(&mut buf);
        let digest_free_len = buf.len() - 32 - 2 - 2 - 2;
        let message = &buf[..digest_free_len];

        match validate_auth(
            mode,
            req.auth.auth_unix_time as u64,
            &req.auth.auth_digest,
            message,
            key,
            server.require_auth,
        ) {
            Ok(()) => {}
            Err(AuthError::OutOfWindow) => return Ok(CrspCode::AuthTime),
            Err(AuthError::AuthRequired) => return Ok(CrspCode::AuthReq),
            Err(AuthError::DigestMismatch) => return Ok(CrspCode::AuthFail),
            Err(AuthError::UnknownKeyId(_)) => return Ok(CrspCode::AuthInv),
        }
    } else if mode != AuthMode::None {
        return Ok(CrspCode::AuthNc);
    } else if server.require_auth {
        return Ok(CrspCode::AuthReq);
    }

    Ok(CrspCode::AckOk)
}

/// Server-side CHTA validation and clamping chain (spec.md §4.4): numeric
/// range checks, then policy clamp via `ServerConfig::clamp`.
pub fn police_chta(
    req: &ChtaRequest,
    server: &ServerConfig,
    defaults: &TestConfig,
) -> (CrspCode, TestConfig) {
    if req.low_thresh_ms == 0 || req.upper_thresh_ms == 0 || req.test_interval_time_s == 0 {
        return (CrspCode::BadParam, defaults.clone());
    }
    if server.max_bandwidth_mbps > 0 {
        // A request pinned to the table's fastest rows with no room to adapt
        // down is rejected outright rather than silently reinterpreted.
        if !req.sr_index_is_start && req.sr_index as usize >= crate::net::srate::MAX_SENDING_RATES {
            return (CrspCode::CapExc, defaults.clone());
        }
    }

    let mut proposed = defaults.clone();
    proposed.low_thresh_ms = req.low_thresh_ms;
    proposed.upper_thresh_ms = req.upper_thresh_ms;
    proposed.test_interval_time_s = req.test_interval_time_s;
    proposed.sub_interval_period_ms = req.sub_interval_period_ms;
    proposed.sr_index_conf = Some(req.sr_index);
    proposed.sr_index_is_start = req.sr_index_is_start;
    proposed.dscp_ecn = req.dscp_ecn;
    proposed.upstream = req.upstream;

    let clamped = server.clamp(proposed, defaults);
    (CrspCode::AckOk, clamped)
}

/// Build the `RateController` a policed CHTA decision should start with.
pub fn rate_controller_for(config: &TestConfig) -> RateController {
    let start = match (config.sr_index_conf, config.sr_index_is_start) {
        (Some(i), true) => StartMode::Start(i),
        (Some(i), false) => StartMode::Fixed(i),
        (None, _) => StartMode::Default,
    };
    RateController::new(config.rate_adj_algo, start, config.high_speed_delta, config.slow_adj_thresh)
}

/// Build a CHSR response PDU for a policed decision. `test_port` is the
/// ephemeral data-plane port the server allocated for this test (0 if the
/// decision was a rejection and no port was allocated).
pub fn build_chsr_response(
    crsp: CrspCode,
    conn_id: u32,
    jumbo_status: u8,
    test_port: u16,
    auth: AuthTail,
) -> ChsrResponse {
    ChsrResponse {
        protocol_ver: PROTOCOL_VER,
        crsp_code: crsp as u16,
        jumbo_status,
        conn_id,
        test_port,
        auth,
    }
}

/// Build a CHTA response PDU for a policed decision.
pub fn build_chta_response(crsp: CrspCode, conn_id: u32, config: &TestConfig, auth: AuthTail) -> ChtaResponse {
    ChtaResponse {
        conn_id,
        crsp_code: crsp as u16,
        low_thresh_ms: config.low_thresh_ms,
        upper_thresh_ms: config.upper_thresh_ms,
        test_interval_time_s: config.test_interval_time_s,
        sub_interval_period_ms: config.sub_interval_period_ms,
        sr_index: config.sr_index_conf.unwrap_or(0),
        auth,
    }
}

/// Raised when a CHSR/CHTA exchange concludes with anything other than
/// `AckOk`; carried up to the caller via `UdpstError::PeerRejected`.
pub fn reject_if_not_ok(crsp: CrspCode) -> Result<(), UdpstError> {
    if crsp.is_ok() {
        Ok(())
    } else {
        Err(UdpstError::PeerRejected(crsp))
    }
}

pub fn log_rejected_peer(addr: SocketAddr, crsp: CrspCode) {
    warn!(peer = %addr, code = ?crsp, "rejected handshake request");
}

/// Short hex prefix of a claimed auth digest, for diagnosing `AuthFail`
/// rejections without logging the full 32-byte HMAC.
pub fn digest_prefix_hex(digest: &[u8; 32]) -> String {
    hex::encode(&digest[..4])
}

pub fn log_auth_failure(addr: SocketAddr, key_id: u16, digest: &[u8; 32]) {
    warn!(
        peer = %addr,
        key_id,
        digest_prefix = %digest_prefix_hex(digest),
        "rejected handshake request: HMAC digest mismatch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::AuthTail;

    fn zero_auth() -> AuthTail {
        AuthTail::zeroed()
    }

    #[test]
    fn police_chsr_rejects_version_outside_range() {
        let server = ServerConfig::default();
        let req = ChsrRequest {
            protocol_ver: 5,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 0,
            mc_index: 0,
            mc_count: 0,
            auth: zero_auth(),
        };
        let crsp = police_chsr(&req, &server, None).unwrap();
        assert_eq!(crsp, CrspCode::BadVer);
    }

    #[test]
    fn police_chsr_rejects_invalid_mc_params() {
        let server = ServerConfig::default();
        let req = ChsrRequest {
            protocol_ver: PROTOCOL_VER,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 1,
            mc_index: 5,
            mc_count: 3,
            auth: zero_auth(),
        };
        let err = police_chsr(&req, &server, None).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidMcParams);
    }

    #[test]
    fn police_chsr_rejects_auth_when_required_but_absent() {
        let mut server = ServerConfig::default();
        server.require_auth = true;
        let req = ChsrRequest {
            protocol_ver: PROTOCOL_VER,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 0,
            mc_index: 0,
            mc_count: 0,
            auth: zero_auth(),
        };
        let crsp = police_chsr(&req, &server, None).unwrap();
        assert_eq!(crsp, CrspCode::AuthReq);
    }

    #[test]
    fn police_chsr_accepts_clean_request() {
        let server = ServerConfig::default();
        let req = ChsrRequest {
            protocol_ver: PROTOCOL_VER,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 0,
            mc_index: 0,
            mc_count: 0,
            auth: zero_auth(),
        };
        assert_eq!(police_chsr(&req, &server, None).unwrap(), CrspCode::AckOk);
    }

    #[test]
    fn police_chta_rejects_zero_thresholds() {
        let server = ServerConfig::default();
        let defaults = TestConfig::default();
        let req = ChtaRequest {
            conn_id: 1,
            upstream: false,
            low_thresh_ms: 0,
            upper_thresh_ms: 10,
            test_interval_time_s: 10,
            sub_interval_period_ms: 1000,
            sr_index: 20,
            sr_index_is_start: true,
            dscp_ecn: 0,
            auth: zero_auth(),
        };
        let (crsp, _) = police_chta(&req, &server, &defaults);
        assert_eq!(crsp, CrspCode::BadParam);
    }

    #[test]
    fn police_chta_clamps_never_raises() {
        let mut server = ServerConfig::default();
        server.max_test_interval_time_s = 30;
        let defaults = TestConfig::default();
        let req = ChtaRequest {
            conn_id: 1,
            upstream: false,
            low_thresh_ms: 5,
            upper_thresh_ms: 10,
            test_interval_time_s: 999,
            sub_interval_period_ms: 1000,
            sr_index: 20,
            sr_index_is_start: true,
            dscp_ecn: 0,
            auth: zero_auth(),
        };
        let (crsp, config) = police_chta(&req, &server, &defaults);
        assert_eq!(crsp, CrspCode::AckOk);
        assert_eq!(config.test_interval_time_s, 30);
    }

    #[test]
    fn session_stop_sequence_progresses_through_stop1_stop2() {
        let mut session = Session::new();
        session.start(1);
        assert_eq!(session.state, TestAction::Test);
        session.stop_test();
        assert_eq!(session.state, TestAction::Stop1);
        session.stop_test();
        assert_eq!(session.state, TestAction::Stop2);
    }

    #[test]
    fn test_action_wire_round_trips() {
        for action in [TestAction::Idle, TestAction::Test, TestAction::Stop1, TestAction::Stop2] {
            assert_eq!(TestAction::from_wire(action.as_wire()), action);
        }
    }

    #[test]
    fn session_mirrors_peer_stop1_without_local_stop_request() {
        let mut session = Session::new();
        session.start(1);
        session.observe_peer(TestAction::Stop1);
        assert_eq!(session.state, TestAction::Stop1);
    }

    #[test]
    fn session_does_not_regress_past_stop2_on_peer_mirror() {
        let mut session = Session::new();
        session.start(1);
        session.stop_test();
        session.stop_test();
        assert_eq!(session.state, TestAction::Stop2);
        session.observe_peer(TestAction::Stop1);
        assert_eq!(session.state, TestAction::Stop2);
    }

    #[test]
    fn reject_if_not_ok_passes_through_ack() {
        assert!(reject_if_not_ok(CrspCode::AckOk).is_ok());
        assert!(reject_if_not_ok(CrspCode::AuthFail).is_err());
    }

    #[test]
    fn digest_prefix_hex_encodes_first_four_bytes() {
        let mut digest = [0u8; 32];
        digest[0] = 0xDE;
        digest[1] = 0xAD;
        digest[2] = 0xBE;
        digest[3] = 0xEF;
        assert_eq!(digest_prefix_hex(&digest), "deadbeef");
    }
}
