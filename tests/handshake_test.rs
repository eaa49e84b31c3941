//! End-to-end exercises of the control-plane handshake and the rate
//! controller/data-plane pieces it wires together, without a real socket
//! (spec.md §8 scenarios: clean handshake, version mismatch, auth failure,
//! bandwidth cap, rate convergence).

use bytes::BytesMut;

use udpst::config::{ServerConfig, TestConfig};
use udpst::net::auth::{compute_digest, derive_keys, AuthMode};
use udpst::net::codec::{AuthTail, ChsrRequest, ChsrResponse, ChtaRequest};
use udpst::net::control::{build_chsr_response, police_chsr, police_chta, rate_controller_for};
use udpst::net::protocol::{CrspCode, PROTOCOL_VER};
use udpst::net::rate::TrialClass;

fn zero_auth() -> AuthTail {
    AuthTail::zeroed()
}

#[test]
fn clean_handshake_is_accepted_and_roundtrips_on_the_wire() {
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
    let crsp = police_chsr(&req, &server, None).unwrap();
    assert_eq!(crsp, CrspCode::AckOk);

    let response = build_chsr_response(crsp, 0, 0, 33445, zero_auth());
    let mut buf = BytesMut::new();
    response.encode(&mut buf);
    let decoded = ChsrResponse::decode(&buf).unwrap();
    assert_eq!(decoded.crsp(), Some(CrspCode::AckOk));
    assert_eq!(decoded.test_port, 33445);
}

#[test]
fn version_mismatch_is_rejected_before_any_connection_is_allocated() {
    let server = ServerConfig::default();
    let req = ChsrRequest {
        protocol_ver: 1,
        jumbo_status: 0,
        traditional_mtu: false,
        mc_ident: 0,
        mc_index: 0,
        mc_count: 0,
        auth: zero_auth(),
    };
    assert_eq!(police_chsr(&req, &server, None).unwrap(), CrspCode::BadVer);
}

#[test]
fn authenticated_handshake_round_trips_through_hmac_validation() {
    let shared_key = b"a shared test key";
    let auth_unix_time = 1_700_000_000u32;
    let keys = derive_keys(shared_key, auth_unix_time as u64);

    let mut req = ChsrRequest {
        protocol_ver: PROTOCOL_VER,
        jumbo_status: 0,
        traditional_mtu: false,
        mc_ident: 0,
        mc_index: 0,
        mc_count: 0,
        auth: AuthTail {
            auth_mode: AuthMode::HmacSha256 as u8,
            auth_unix_time,
            auth_digest: [0u8; 32],
            key_id: 1,
            reserved_auth1: 0,
            check_sum: 0,
        },
    };

    // Sign over the request with the digest field zeroed, mirroring how a
    // real client would populate `auth_digest` before sending.
    let mut buf = BytesMut::new();
    req.encode(&mut buf);
    let digest_free_len = buf.len() - 32 - 2 - 2 - 2;
    let digest = compute_digest(&keys.client_key, &buf[..digest_free_len]);
    req.auth.auth_digest = digest;

    let server = ServerConfig::default();
    let crsp = police_chsr(&req, &server, Some(&keys.client_key)).unwrap();
    assert_eq!(crsp, CrspCode::AckOk);
}

#[test]
fn tampered_digest_is_rejected_with_auth_fail() {
    let shared_key = b"a shared test key";
    let auth_unix_time = 1_700_000_000u32;
    let keys = derive_keys(shared_key, auth_unix_time as u64);

    let req = ChsrRequest {
        protocol_ver: PROTOCOL_VER,
        jumbo_status: 0,
        traditional_mtu: false,
        mc_ident: 0,
        mc_index: 0,
        mc_count: 0,
        auth: AuthTail {
            auth_mode: AuthMode::HmacSha256 as u8,
            auth_unix_time,
            auth_digest: [0xFFu8; 32], // wrong on purpose
            key_id: 1,
            reserved_auth1: 0,
            check_sum: 0,
        },
    };

    let server = ServerConfig::default();
    let crsp = police_chsr(&req, &server, Some(&keys.client_key)).unwrap();
    assert_eq!(crsp, CrspCode::AuthFail);
}

#[test]
fn bandwidth_cap_rejects_a_fixed_high_rate_request() {
    let mut server = ServerConfig::default();
    server.max_bandwidth_mbps = 100;
    let defaults = TestConfig::default();

    let req = ChtaRequest {
        conn_id: 1,
        upstream: false,
        low_thresh_ms: 5,
        upper_thresh_ms: 10,
        test_interval_time_s: 10,
        sub_interval_period_ms: 1000,
        sr_index: u16::MAX,
        sr_index_is_start: false,
        dscp_ecn: 0,
        auth: zero_auth(),
    };
    let (crsp, _) = police_chta(&req, &server, &defaults);
    assert_eq!(crsp, CrspCode::CapExc);
}

#[test]
fn negotiated_test_config_drives_a_converging_rate_controller() {
    let server = ServerConfig::default();
    let defaults = TestConfig::default();

    let req = ChtaRequest {
        conn_id: 1,
        upstream: false,
        low_thresh_ms: 5,
        upper_thresh_ms: 10,
        test_interval_time_s: 10,
        sub_interval_period_ms: 1000,
        sr_index: 30,
        sr_index_is_start: true,
        dscp_ecn: 0,
        auth: zero_auth(),
    };
    let (crsp, config) = police_chta(&req, &server, &defaults);
    assert_eq!(crsp, CrspCode::AckOk);

    let mut controller = rate_controller_for(&config);
    let start = controller.index();

    // A link that's always under-utilised should climb toward the top of
    // the table and never overshoot it.
    for _ in 0..500 {
        controller.on_trial(TrialClass::UnderUtilised);
    }
    assert!(controller.index() >= start);
    assert!((controller.index() as usize) < udpst::net::srate::MAX_SENDING_RATES);

    // Sustained congestion should walk it back down without underflowing.
    for _ in 0..500 {
        controller.on_trial(TrialClass::Congested);
    }
    assert!(controller.index() < u16::MAX);
}
