//! Process-wide state for one role instance (client or server), and the
//! `session_start`/`session_stop` boundary API spec.md §6 exposes to
//! collaborators.
//!
//! A `Repository` is spec.md §3's process-wide entity: per-direction
//! bandwidth accounting, the precomputed sending-rate table, and the
//! multi-connection identifier pool. `run_client`/`run_server_session` wire
//! it together with the control handshake (`net::control`), the data-plane
//! sender/receiver (`net::data`), the rate controller (`net::rate`), and the
//! aggregator (`net::aggregate`) into one cooperative, single-threaded
//! session per connection (spec.md §5) — the data flow spec.md §2 describes
//! end to end rather than as isolated components.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, TestConfig};
use crate::error::UdpstError;
use crate::net::aggregate::{Aggregator, GroupSubInterval, TestSummary};
use crate::net::auth::{compute_digest, derive_keys, validate_auth, AuthMode};
use crate::net::codec::{
    peek_pdu_id, AuthTail, ChnrRequest, ChsrRequest, ChsrResponse, ChtaRequest, ChtaResponse, LoadPdu, StatusPdu,
};
use crate::net::conn::{bind_connection_socket, set_ip_tos, PerfStatsCounters};
use crate::net::control::{
    build_chsr_response, build_chta_response, police_chsr, police_chta, reject_if_not_ok, rate_controller_for,
    Session, TestAction,
};
use crate::net::data::{Receiver, Sender};
use crate::net::protocol::{CrspCode, CHNR_PVER, LOAD_ID, PROTOCOL_VER, STATUS_ID};
use crate::net::rate::{RateController, TrialClass};
use crate::net::srate::{build_table, SendingRate};
use crate::net::timer::{check_watchdog, ConnectionTimers, EventLoop, TimerKind};
use crate::time::{unix_time_secs, Deadline};

/// No-traffic watchdog bound for an established data-phase connection,
/// matching the handshake's own `recv_with_timeout` bound (spec.md §4.7 C7).
const DATA_WATCHDOG: Duration = Duration::from_secs(10);

/// How long the auth tail's trailing fields (digest, keyId, reservedAuth1,
/// checksum) take up — excluded from the HMAC'd message, mirroring
/// `net::control::police_chsr`'s validation-side slicing.
const AUTH_TRAILER_LEN: usize = 32 + 2 + 2 + 2;

/// Longest datagram this crate's sockets exchange; large enough for any
/// control PDU plus a generous data-plane payload.
const RECV_BUF_LEN: usize = 2048;

/// Process-wide state shared by every connection this role instance drives
/// (spec.md §3 Repository). Not `Send`-shared across tasks: a server spawns
/// one connection's worth of data-phase work per accepted client, but the
/// bandwidth counters and rate table here are only ever touched from the
/// single task that owns this `Repository`.
pub struct Repository {
    pub server: ServerConfig,
    pub rate_table: Vec<SendingRate>,
    pub us_bandwidth_mbps: u32,
    pub ds_bandwidth_mbps: u32,
}

impl Repository {
    pub fn new(server: ServerConfig) -> Self {
        Repository { server, rate_table: build_table(), us_bandwidth_mbps: 0, ds_bandwidth_mbps: 0 }
    }

    /// A fresh `mcIdent`: uniform in `[1, 65535]`, never zero (spec.md §3).
    pub fn random_mc_ident() -> u16 {
        rand::thread_rng().gen_range(1..=u16::MAX)
    }

    /// Reserve `requested_mbps` against one direction's running total,
    /// rejecting with `CapExc` if it would exceed `server.max_bandwidth_mbps`
    /// (0 = unbounded), per spec.md §4.4's "reject if currentDir + requested
    /// > configured.maxBandwidth" and Testable Property scenario 4.
    pub fn allocate_bandwidth(&mut self, upstream: bool, requested_mbps: u32) -> Result<(), CrspCode> {
        if self.server.max_bandwidth_mbps == 0 {
            return Ok(());
        }
        let current = if upstream { self.us_bandwidth_mbps } else { self.ds_bandwidth_mbps };
        if current.saturating_add(requested_mbps) > self.server.max_bandwidth_mbps {
            return Err(CrspCode::CapExc);
        }
        if upstream {
            self.us_bandwidth_mbps += requested_mbps;
        } else {
            self.ds_bandwidth_mbps += requested_mbps;
        }
        Ok(())
    }

    pub fn release_bandwidth(&mut self, upstream: bool, mbps: u32) {
        if upstream {
            self.us_bandwidth_mbps = self.us_bandwidth_mbps.saturating_sub(mbps);
        } else {
            self.ds_bandwidth_mbps = self.ds_bandwidth_mbps.saturating_sub(mbps);
        }
    }
}

/// Reporting callbacks a caller installs before `run_client`/
/// `run_server_session` (spec.md §6: `on_subinterval`, `on_summary`,
/// `on_error`).
#[derive(Default)]
pub struct SessionHooks {
    pub on_subinterval: Option<Box<dyn FnMut(GroupSubInterval) + Send>>,
    pub on_summary: Option<Box<dyn FnMut(TestSummary) + Send>>,
    pub on_error: Option<Box<dyn FnMut(&UdpstError) + Send>>,
}

impl SessionHooks {
    fn fire_subinterval(&mut self, row: GroupSubInterval) {
        if let Some(f) = self.on_subinterval.as_mut() {
            f(row);
        }
    }

    fn fire_summary(&mut self, summary: TestSummary) {
        if let Some(f) = self.on_summary.as_mut() {
            f(summary);
        }
    }

    fn fire_error(&mut self, err: &UdpstError) {
        if let Some(f) = self.on_error.as_mut() {
            f(err);
        }
    }
}

/// A running session's cooperative stop switch: `stop()` is `session_stop`
/// from spec.md §6, checked once per data-phase tick so the running task
/// drains its current sub-interval before tearing down (spec.md §4.4
/// "Termination": `Stop1` then `Stop2`).
#[derive(Clone, Default)]
pub struct SessionHandle {
    stop_requested: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }
}

/// Sign `message` (the encoded PDU with the auth tail's digest/keyId/
/// reservedAuth1/checksum fields zeroed) under `key`, returning the tail to
/// splice back in. Mirrors `net::control::police_chsr`'s validation-side
/// slicing so insertion and validation agree on what the HMAC covers.
fn sign_tail(auth_mode: AuthMode, now: u32, key_id: u16, key: &[u8], encoded_with_zero_tail: &[u8]) -> AuthTail {
    let msg_len = encoded_with_zero_tail.len().saturating_sub(AUTH_TRAILER_LEN);
    let digest = compute_digest(key, &encoded_with_zero_tail[..msg_len]);
    AuthTail { auth_mode: auth_mode as u8, auth_unix_time: now, auth_digest: digest, key_id, reserved_auth1: 0, check_sum: 0 }
}

/// Build and sign a CHSR request, or leave it unauthenticated when no key is
/// configured (spec.md §4.4 step 1-2).
fn build_chsr_request(mc_ident: u32, mc_count: u16, client_key: Option<&[u8]>) -> ChsrRequest {
    let now = unix_time_secs() as u32;
    let mut req = ChsrRequest {
        protocol_ver: PROTOCOL_VER,
        jumbo_status: 0,
        traditional_mtu: true,
        mc_ident,
        mc_index: 0,
        mc_count,
        auth: AuthTail::zeroed(),
    };
    if let Some(key) = client_key {
        req.auth = AuthTail { auth_mode: AuthMode::HmacSha256 as u8, auth_unix_time: now, ..AuthTail::zeroed() };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        req.auth = sign_tail(AuthMode::HmacSha256, now, 0, key, &buf);
    }
    req
}

fn build_chta_request(conn_id: u32, config: &TestConfig, client_key: Option<&[u8]>) -> ChtaRequest {
    let now = unix_time_secs() as u32;
    let mut req = ChtaRequest {
        conn_id,
        upstream: config.upstream,
        low_thresh_ms: config.low_thresh_ms,
        upper_thresh_ms: config.upper_thresh_ms,
        test_interval_time_s: config.test_interval_time_s,
        sub_interval_period_ms: config.sub_interval_period_ms,
        sr_index: config.sr_index_conf.unwrap_or(0),
        sr_index_is_start: config.sr_index_is_start,
        dscp_ecn: config.dscp_ecn,
        auth: AuthTail::zeroed(),
    };
    if let Some(key) = client_key {
        req.auth = AuthTail { auth_mode: AuthMode::HmacSha256 as u8, auth_unix_time: now, ..AuthTail::zeroed() };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        req.auth = sign_tail(AuthMode::HmacSha256, now, 0, key, &buf);
    }
    req
}

/// Verify a response's auth tail against `key`, when authentication is in
/// use. A caller with no key configured skips verification — matching mode-0
/// (unauthenticated) operation.
fn verify_response_auth<F: Fn(&AuthTail) -> BytesMut>(key: Option<&[u8]>, auth: &AuthTail, reencode_zeroed: F) -> Result<(), UdpstError> {
    let Some(key) = key else { return Ok(()) };
    let mode = AuthMode::from_u8(auth.auth_mode).unwrap_or(AuthMode::None);
    let zeroed = AuthTail { auth_digest: [0u8; 32], check_sum: 0, ..*auth };
    let buf = reencode_zeroed(&zeroed);
    let msg_len = buf.len().saturating_sub(AUTH_TRAILER_LEN);
    validate_auth(mode, auth.auth_unix_time as u64, &auth.auth_digest, &buf[..msg_len], key, key_requires_auth(mode))
        .map_err(UdpstError::from)
}

fn key_requires_auth(mode: AuthMode) -> bool {
    matches!(mode, AuthMode::HmacSha256)
}

/// Classify one trial's delay-variation/sequence-error sample against a
/// `TestConfig`'s thresholds (spec.md §4.6's common classification step).
fn classify_trial(config: &TestConfig, delay_var_ms: u32, seq_err_delta: u32) -> TrialClass {
    if delay_var_ms >= config.upper_thresh_ms || seq_err_delta >= config.seq_err_thresh {
        TrialClass::Congested
    } else if delay_var_ms <= config.low_thresh_ms && seq_err_delta < config.seq_err_thresh {
        TrialClass::UnderUtilised
    } else {
        TrialClass::Steady
    }
}

/// Client-side driver for one measurement session: CHSR, then CHTA, then the
/// data phase, returning the end-of-test summary (spec.md §4.4 client
/// sequence, §6 `session_start`).
pub async fn run_client(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    mut config: TestConfig,
    shared_key: Option<Vec<u8>>,
    handle: &SessionHandle,
    hooks: &mut SessionHooks,
) -> Result<TestSummary, UdpstError> {
    socket.connect(server_addr).await?;

    let mc_ident = Repository::random_mc_ident() as u32;
    let client_keys = shared_key.as_deref().map(|k| derive_keys(k, unix_time_secs()));
    let client_key = client_keys.as_ref().map(|k| k.client_key.as_slice());

    let chsr_req = build_chsr_request(mc_ident, 1, client_key);
    let mut out = BytesMut::new();
    chsr_req.encode(&mut out);
    socket.send(&out).await?;

    let mut buf = [0u8; RECV_BUF_LEN];
    let n = recv_with_timeout(socket, &mut buf, Duration::from_secs(10)).await?;
    let chsr_resp = ChsrResponse::decode(&buf[..n]).map_err(|_| UdpstError::PeerRejected(CrspCode::ConnFail))?;
    verify_response_auth(client_keys.as_ref().map(|k| k.server_key.as_slice()), &chsr_resp.auth, |zeroed| {
        let mut b = BytesMut::new();
        ChsrResponse { auth: *zeroed, ..chsr_resp.clone() }.encode(&mut b);
        b
    })?;
    let crsp = chsr_resp.crsp().unwrap_or(CrspCode::ConnFail);
    reject_if_not_ok(crsp)?;
    let conn_id = chsr_resp.conn_id;
    info!(conn_id, peer = %server_addr, "CHSR accepted");

    // Re-point the data socket at the server's freshly allocated test port
    // (spec.md §4.4 step 4, §8 scenario 1).
    let test_addr = SocketAddr::new(server_addr.ip(), chsr_resp.test_port);
    socket.connect(test_addr).await?;
    info!(conn_id, test_port = chsr_resp.test_port, "reconnected to test port");

    let chta_req = build_chta_request(conn_id, &config, client_key);
    let mut out = BytesMut::new();
    chta_req.encode(&mut out);
    socket.send(&out).await?;

    let n = recv_with_timeout(socket, &mut buf, Duration::from_secs(10)).await?;
    let chta_resp = ChtaResponse::decode(&buf[..n]).map_err(|_| UdpstError::PeerRejected(CrspCode::BadParam))?;
    verify_response_auth(client_keys.as_ref().map(|k| k.server_key.as_slice()), &chta_resp.auth, |zeroed| {
        let mut b = BytesMut::new();
        ChtaResponse { auth: *zeroed, ..chta_resp.clone() }.encode(&mut b);
        b
    })?;
    let crsp = chta_resp.crsp().unwrap_or(CrspCode::BadParam);
    reject_if_not_ok(crsp)?;

    // Adopt the server's policed values (spec.md §4.4 step 5).
    config.low_thresh_ms = chta_resp.low_thresh_ms;
    config.upper_thresh_ms = chta_resp.upper_thresh_ms;
    config.test_interval_time_s = chta_resp.test_interval_time_s;
    config.sub_interval_period_ms = chta_resp.sub_interval_period_ms;
    config.sr_index_conf = Some(chta_resp.sr_index);
    info!(conn_id, "CHTA accepted, entering data phase");

    // Apply our own requested DSCP/ECN byte to the test socket on the
    // CHTA-ACKOK transition (spec.md §4.4 step 5); the wire response carries
    // no echo field, so the client applies the value it asked for.
    if let Err(e) = set_ip_tos(socket, config.dscp_ecn) {
        warn!(conn_id, error = %e, "failed to set IP_TOS on test socket");
    }

    // `upstream` names the client's direction: client sends when true.
    run_data_phase(socket, conn_id, &config, config.upstream, handle, hooks).await
}

/// Server-side driver for one accepted client: polices CHSR then CHTA, then
/// runs the symmetric data phase (spec.md §4.4 server sequence).
pub async fn run_server_session(
    socket: &UdpSocket,
    peer_addr: SocketAddr,
    repo: &mut Repository,
    defaults: &TestConfig,
    handle: &SessionHandle,
    hooks: &mut SessionHooks,
) -> Result<TestSummary, UdpstError> {
    socket.connect(peer_addr).await?;

    let mut buf = [0u8; RECV_BUF_LEN];
    let n = recv_with_timeout(socket, &mut buf, Duration::from_secs(10)).await?;
    let chsr_req = ChsrRequest::decode(&buf[..n]).map_err(|_| UdpstError::PeerRejected(CrspCode::ConnFail))?;

    let crsp = police_chsr(&chsr_req, &repo.server, repo.server.shared_key.as_deref())
        .unwrap_or(CrspCode::McInvPar);
    let conn_id = peer_addr.port() as u32;

    if !crsp.is_ok() {
        let resp = build_chsr_response(crsp, conn_id, chsr_req.jumbo_status, 0, AuthTail::zeroed());
        let mut out = BytesMut::new();
        resp.encode(&mut out);
        socket.send(&out).await?;
        if crsp == CrspCode::AuthFail {
            crate::net::control::log_auth_failure(peer_addr, chsr_req.auth.key_id, &chsr_req.auth.auth_digest);
        } else {
            crate::net::control::log_rejected_peer(peer_addr, crsp);
        }
        return Err(UdpstError::PeerRejected(crsp));
    }

    // Allocate the test connection's own datagram socket and advertise its
    // port in the CHSR response; the client reconnects here before sending
    // CHTA (spec.md §4.4 step 2/4, §8 scenario 1).
    let data_socket = bind_connection_socket(peer_addr, &repo.server).await?;
    data_socket.connect(peer_addr).await?;
    let test_port = data_socket.local_addr()?.port();

    let resp = build_chsr_response(crsp, conn_id, chsr_req.jumbo_status, test_port, AuthTail::zeroed());
    let mut out = BytesMut::new();
    resp.encode(&mut out);
    socket.send(&out).await?;
    info!(conn_id, test_port, peer = %peer_addr, "CHSR accepted, allocated test port");

    if chsr_req.protocol_ver >= CHNR_PVER {
        let chnr = ChnrRequest { conn_id };
        let mut out = BytesMut::new();
        chnr.encode(&mut out);
        // Best-effort NAT/firewall primer; no response is expected.
        let _ = data_socket.send(&out).await;
    }

    // From here on, the client has reconnected to `test_port`: CHTA and the
    // data phase both run over `data_socket`, not the original control one.
    let n = recv_with_timeout(&data_socket, &mut buf, Duration::from_secs(10)).await?;
    let chta_req = ChtaRequest::decode(&buf[..n]).map_err(|_| UdpstError::PeerRejected(CrspCode::BadParam))?;

    let (crsp, mut policed) = police_chta(&chta_req, &repo.server, defaults);
    // `ChtaRequest` carries no explicit Mbps field; the sending-rate index it
    // does carry is the bandwidth request, so look up what that row actually
    // costs in the precomputed table (spec.md §3's Repository-owned rate
    // table) rather than trusting an unset `TestConfig::max_bandwidth_mbps`.
    let row_index = (policed.sr_index_conf.unwrap_or(0) as usize).min(repo.rate_table.len() - 1);
    let requested_mbps = (repo.rate_table[row_index].nominal_bps() / 1_000_000.0).ceil() as u32;
    policed.max_bandwidth_mbps = requested_mbps;
    let crsp = if crsp.is_ok() {
        match repo.allocate_bandwidth(policed.upstream, requested_mbps) {
            Ok(()) => CrspCode::AckOk,
            Err(cap) => cap,
        }
    } else {
        crsp
    };
    let resp = build_chta_response(crsp, conn_id, &policed, AuthTail::zeroed());
    let mut out = BytesMut::new();
    resp.encode(&mut out);
    data_socket.send(&out).await?;
    if !crsp.is_ok() {
        crate::net::control::log_rejected_peer(peer_addr, crsp);
        return Err(UdpstError::PeerRejected(crsp));
    }

    // Apply the negotiated DSCP/ECN byte to the test socket on the
    // CHTA-ACKOK transition (spec.md §4.4 step 5). Best-effort: a platform
    // that rejects IP_TOS shouldn't fail an otherwise-accepted test.
    if let Err(e) = set_ip_tos(&data_socket, policed.dscp_ecn) {
        warn!(conn_id, error = %e, "failed to set IP_TOS on test socket");
    }

    policed.sr_index_conf = Some(chta_req.sr_index);
    // `policed.upstream` still names the client's direction; the server's
    // own role is the opposite one.
    let we_send = !policed.upstream;
    let result = run_data_phase(&data_socket, conn_id, &policed, we_send, handle, hooks).await;
    repo.release_bandwidth(policed.upstream, policed.max_bandwidth_mbps);
    result
}

/// The symmetric data-phase loop: whichever side `we_send` names drives
/// `Sender`; the other drives `Receiver` and periodic `Status` feedback
/// (spec.md §4.5, §4.6). The caller resolves `we_send` from its own role,
/// since `config.upstream` always names the client's direction regardless of
/// which side is running this function.
async fn run_data_phase(
    socket: &UdpSocket,
    conn_id: u32,
    config: &TestConfig,
    we_send: bool,
    handle: &SessionHandle,
    hooks: &mut SessionHooks,
) -> Result<TestSummary, UdpstError> {
    let rate_table = build_table();
    let mut rate = rate_controller_for(config);

    if we_send {
        run_sender_side(socket, conn_id, config, &rate_table, &mut rate, handle, hooks).await
    } else {
        run_receiver_side(socket, conn_id, config, handle, hooks).await
    }
}

async fn run_sender_side(
    socket: &UdpSocket,
    conn_id: u32,
    config: &TestConfig,
    rate_table: &[SendingRate],
    rate: &mut RateController,
    handle: &SessionHandle,
    hooks: &mut SessionHooks,
) -> Result<TestSummary, UdpstError> {
    let start = Deadline::now();
    let end = start.plus(Duration::from_secs(config.test_interval_time_s as u64));
    let mut sender = Sender::new(conn_id, &rate_table[rate.index() as usize], start);
    let mut last_seq_err_total: u32 = 0;
    let mut buf = [0u8; RECV_BUF_LEN];
    let mut aggregator = Aggregator::new(config.bimodal_count);

    let mut session = Session::new();
    session.start(conn_id);
    // Echoed back verbatim on the next outgoing Load PDU so the receiver can
    // compute RTT purely from its own clock (spec.md §4.5's tx/rx timespec
    // pair).
    let mut last_status_tx_time: (u32, u32) = (0, 0);
    let mut last_status_rx_time: (u32, u32) = (0, 0);
    let mut perf_stats = PerfStatsCounters::default();
    // Set once the peer has acknowledged our Stop1; gates the Stop1 -> Stop2
    // transition and the 500ms teardown window (spec.md §8 scenario 6).
    let mut stop_deadline: Option<Deadline> = None;
    let mut event_loop = EventLoop::new();
    let mut timers = ConnectionTimers::new(start, DATA_WATCHDOG);

    loop {
        let now = event_loop.tick().await;
        if handle.should_stop() && session.state == TestAction::Test {
            session.stop_test();
        }
        if session.state == TestAction::Stop1 && stop_deadline.is_none() {
            stop_deadline = Some(now.plus(Duration::from_millis(500)));
        }
        let stopped = session.state == TestAction::Stop2
            || stop_deadline.map(|d| now.has_elapsed(d.instant())).unwrap_or(false);
        if now.has_elapsed(end.instant()) || stopped {
            break;
        }
        if matches!(timers.due(&now), Some(TimerKind::Watchdog)) {
            check_watchdog(&timers, &now, conn_id)?;
        }

        let send_time = unix_secs_and_nanos();
        for mut pdu in sender.due_datagrams(now, send_time) {
            pdu.test_action = session.state.as_wire();
            pdu.spdu_seq_err = last_seq_err_total;
            pdu.rtt_tx_time_secs = last_status_tx_time.0;
            pdu.rtt_tx_time_nanos = last_status_tx_time.1;
            pdu.rtt_rx_time_secs = last_status_rx_time.0;
            pdu.rtt_rx_time_nanos = last_status_rx_time.1;
            let mut out = BytesMut::new();
            pdu.encode(&mut out);
            if socket.try_send(&out).is_err() {
                // would-block: the burst simply waits for the next tick
                // (spec.md §5).
                break;
            }
        }

        while let Ok(n) = socket.try_recv(&mut buf) {
            match peek_pdu_id(&buf[..n]) {
                Ok(STATUS_ID) => {}
                Ok(_) => {
                    perf_stats.bad_command += 1;
                    continue;
                }
                Err(_) => {
                    perf_stats.too_short += 1;
                    continue;
                }
            }
            match StatusPdu::decode(&buf[..n]) {
                Err(_) => {
                    perf_stats.too_short += 1;
                    continue;
                }
                Ok(status) => {
                    timers.bump_watchdog(now, DATA_WATCHDOG);
                    last_status_tx_time = (status.spdu_tx_time_secs, status.spdu_tx_time_nanos);
                    last_status_rx_time = unix_secs_and_nanos();
                    session.observe_peer(TestAction::from_wire(status.test_action));
                    if status.rx_stopped && session.state == TestAction::Stop1 {
                        session.stop_test();
                    }

                    let delay_var_ms = (status.delay_var_usec.max(0) / 1000) as u32;
                    let seq_err_delta = status.seq_err_count.saturating_sub(last_seq_err_total);
                    last_seq_err_total = status.seq_err_count;
                    let class = classify_trial(config, delay_var_ms, seq_err_delta);
                    let new_index = rate.on_trial(class);
                    sender.retune(&rate_table[new_index as usize], now);
                    aggregator.add_connection_sample(
                        conn_id,
                        crate::net::data::SubIntervalStats {
                            datagrams_received: 0,
                            bytes_received: 0,
                            sequence_errors: status.seq_err_count,
                            lost: status.loss_count,
                            out_of_order: status.ooo_count,
                            duplicate: status.dup_count,
                            delay_var_sum_usec: status.delay_var_usec as i64,
                            delay_var_samples: 1,
                            // The sender side only learns the receiver's mean
                            // delay variation from the Status PDU, not its
                            // min/max or an RTT sample; those stay STATUS_NODEL.
                            ..Default::default()
                        },
                    );
                    let was_bimodal = aggregator.is_in_bimodal_phase();
                    aggregator.close_sub_interval();
                    if !was_bimodal {
                        if let Some(row) = aggregator.steady_phase.last().cloned() {
                            hooks.fire_subinterval(row);
                        }
                    }
                }
            }
        }
    }

    let mut summary = crate::net::aggregate::summarize(&aggregator.steady_phase);
    summary.perf_stats = perf_stats;
    hooks.fire_summary(summary.clone());
    Ok(summary)
}

async fn run_receiver_side(
    socket: &UdpSocket,
    conn_id: u32,
    config: &TestConfig,
    handle: &SessionHandle,
    hooks: &mut SessionHooks,
) -> Result<TestSummary, UdpstError> {
    let start = Deadline::now();
    let end = start.plus(Duration::from_secs(config.test_interval_time_s as u64));
    let trial_period = Duration::from_millis(config.trial_interval_ms as u64);
    let subint_period = Duration::from_millis(config.sub_interval_period_ms as u64);

    let mut receiver = Receiver::new(config.ignore_ooo_dup);
    let mut aggregator = Aggregator::new(config.bimodal_count);
    let mut buf = [0u8; RECV_BUF_LEN];
    let mut next_trial = start.plus(trial_period);
    let mut next_subint = start.plus(subint_period);
    let mut trial_index: u32 = 0;
    let mut min_one_way_usec: i64 = i64::MAX;

    let mut session = Session::new();
    session.start(conn_id);
    let mut stop_deadline: Option<Deadline> = None;
    let mut perf_stats = PerfStatsCounters::default();
    let mut event_loop = EventLoop::new();
    let mut timers = ConnectionTimers::new(start, DATA_WATCHDOG);
    timers.timer1 = Some(next_trial);
    timers.timer2 = Some(next_subint);

    loop {
        let now = event_loop.tick().await;
        if handle.should_stop() && session.state == TestAction::Test {
            session.stop_test();
        }
        if session.state == TestAction::Stop1 && stop_deadline.is_none() {
            stop_deadline = Some(now.plus(Duration::from_millis(500)));
        }
        let stopped = session.state == TestAction::Stop2
            || stop_deadline.map(|d| now.has_elapsed(d.instant())).unwrap_or(false);
        if now.has_elapsed(end.instant()) || stopped {
            break;
        }

        while let Ok(n) = socket.try_recv(&mut buf) {
            match peek_pdu_id(&buf[..n]) {
                Ok(LOAD_ID) => {}
                Ok(_) => {
                    perf_stats.bad_command += 1;
                    continue;
                }
                Err(_) => {
                    perf_stats.too_short += 1;
                    continue;
                }
            }
            match LoadPdu::decode(&buf[..n]) {
                Err(_) => {
                    perf_stats.too_short += 1;
                    continue;
                }
                Ok(load) => {
                    timers.bump_watchdog(now, DATA_WATCHDOG);
                    session.observe_peer(TestAction::from_wire(load.test_action));
                    let send_at = send_time_usec(&load);
                    let recv_at = unix_secs_and_nanos();
                    let recv_at_usec = recv_at.0 as i64 * 1_000_000 + recv_at.1 as i64 / 1000;
                    let one_way = recv_at_usec - send_at;
                    if one_way < min_one_way_usec {
                        min_one_way_usec = one_way;
                    }
                    let delay_var = (one_way - min_one_way_usec.max(0)) as i32;
                    // An all-zero echo means no Status-PDU RTT probe had
                    // completed yet when this Load PDU was sent (mirrors
                    // export::ExportRow::from_received's own check).
                    let has_rtt_sample = load.rtt_tx_time_secs != 0 || load.rtt_tx_time_nanos != 0;
                    let rtt_usec = has_rtt_sample.then(|| {
                        let rtt_tx_time_usec = load.rtt_tx_time_secs as i64 * 1_000_000
                            + (load.rtt_tx_time_nanos / 1_000) as i64;
                        recv_at_usec - rtt_tx_time_usec
                    });
                    receiver.on_datagram(load.seq_no, delay_var, load.payload.len(), rtt_usec);
                }
            }
        }

        // Timer1 (status cadence) and timer2 (sub-interval close) are
        // dispatched in the reference's timer1 > timer2 > timer3 > watchdog
        // priority order; a tick that finds both due fires timer1 now and
        // timer2 on the next 100us tick rather than both at once.
        match timers.due(&now) {
            Some(TimerKind::Timer1) => {
                let tx_time = unix_secs_and_nanos();
                let acking = session.state != TestAction::Test;
                let status = StatusPdu {
                    conn_id,
                    trial_int_index: trial_index,
                    delay_var_usec: receiver.current.mean_delay_var_usec(),
                    sr_index: 0,
                    seq_err_count: receiver.current.sequence_errors,
                    loss_count: receiver.current.lost,
                    ooo_count: receiver.current.out_of_order,
                    dup_count: receiver.current.duplicate,
                    test_action: session.state.as_wire(),
                    rx_stopped: acking,
                    spdu_tx_time_secs: tx_time.0,
                    spdu_tx_time_nanos: tx_time.1,
                };
                let mut out = BytesMut::new();
                status.encode(&mut out);
                let _ = socket.try_send(&out);
                trial_index += 1;
                next_trial = next_trial.plus(trial_period);
                timers.timer1 = Some(next_trial);
                // Having acked the peer's Stop1 once, advance to Stop2 so the
                // loop exits within the 500ms teardown window.
                if acking && session.state == TestAction::Stop1 {
                    session.stop_test();
                }
            }
            Some(TimerKind::Timer2) => {
                let snapshot = receiver.take_sub_interval();
                aggregator.add_connection_sample(conn_id, snapshot);
                aggregator.close_sub_interval();
                if let Some(row) = aggregator.steady_phase.last().cloned() {
                    if !aggregator.is_in_bimodal_phase() {
                        hooks.fire_subinterval(row);
                    }
                }
                next_subint = next_subint.plus(subint_period);
                timers.timer2 = Some(next_subint);
            }
            Some(TimerKind::Watchdog) => check_watchdog(&timers, &now, conn_id)?,
            Some(TimerKind::Timer3) | None => {}
        }
    }

    let snapshot = receiver.take_sub_interval();
    if snapshot.datagrams_received > 0 {
        aggregator.add_connection_sample(conn_id, snapshot);
        aggregator.close_sub_interval();
    }
    let mut summary = crate::net::aggregate::summarize(&aggregator.steady_phase);
    summary.perf_stats = perf_stats;
    hooks.fire_summary(summary.clone());
    debug!(conn_id, "data phase complete");
    Ok(summary)
}

/// `recv` with a handshake deadline, collapsing `Elapsed` into the same
/// watchdog-style error the data phase raises on a dead connection.
async fn recv_with_timeout(socket: &UdpSocket, buf: &mut [u8], bound: Duration) -> Result<usize, UdpstError> {
    match timeout(bound, socket.recv(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(UdpstError::Timeout(bound.as_secs())),
    }
}

fn unix_secs_and_nanos() -> (u32, u32) {
    let d = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (d.as_secs() as u32, d.subsec_nanos())
}

fn send_time_usec(load: &LoadPdu) -> i64 {
    load.send_time_secs as i64 * 1_000_000 + load.send_time_nanos as i64 / 1000
}

/// Report a fatal session-level error through the `on_error` hook, logging
/// it as well (spec.md §6 `on_error`, §7 propagation policy).
pub fn report_error(hooks: &mut SessionHooks, err: UdpstError) -> UdpstError {
    warn!(error = %err, "session ended with error");
    hooks.fire_error(&err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bandwidth_accepts_within_cap() {
        let mut server = ServerConfig::default();
        server.max_bandwidth_mbps = 100;
        let mut repo = Repository::new(server);
        assert!(repo.allocate_bandwidth(true, 60).is_ok());
        assert_eq!(repo.us_bandwidth_mbps, 60);
    }

    #[test]
    fn allocate_bandwidth_rejects_once_cap_exceeded() {
        let mut server = ServerConfig::default();
        server.max_bandwidth_mbps = 100;
        let mut repo = Repository::new(server);
        repo.allocate_bandwidth(true, 60).unwrap();
        let err = repo.allocate_bandwidth(true, 60).unwrap_err();
        assert_eq!(err, CrspCode::CapExc);
        // Rejected allocation must not have been applied.
        assert_eq!(repo.us_bandwidth_mbps, 60);
    }

    #[test]
    fn allocate_bandwidth_unbounded_when_cap_is_zero() {
        let mut repo = Repository::new(ServerConfig::default());
        assert!(repo.allocate_bandwidth(true, 1_000_000).is_ok());
    }

    #[test]
    fn release_bandwidth_frees_capacity_for_reuse() {
        let mut server = ServerConfig::default();
        server.max_bandwidth_mbps = 100;
        let mut repo = Repository::new(server);
        repo.allocate_bandwidth(false, 100).unwrap();
        repo.release_bandwidth(false, 100);
        assert!(repo.allocate_bandwidth(false, 100).is_ok());
    }

    #[test]
    fn random_mc_ident_is_never_zero() {
        for _ in 0..1000 {
            assert_ne!(Repository::random_mc_ident(), 0);
        }
    }

    #[test]
    fn session_handle_stop_is_observed() {
        let handle = SessionHandle::default();
        assert!(!handle.should_stop());
        handle.stop();
        assert!(handle.should_stop());
    }

    #[test]
    fn classify_trial_matches_threshold_semantics() {
        let config = TestConfig::default();
        assert_eq!(classify_trial(&config, 20, 0), TrialClass::Congested);
        assert_eq!(classify_trial(&config, 1, 0), TrialClass::UnderUtilised);
        assert_eq!(classify_trial(&config, 7, 0), TrialClass::Steady);
        assert_eq!(classify_trial(&config, 0, 5), TrialClass::Congested);
    }
}
