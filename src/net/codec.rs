//! Bit-exact PDU encode/decode (spec.md §4.1, C1).
//!
//! Every PDU is network-byte-order, fixed layout, and carries a trailing
//! auth tail (spec.md §9 DESIGN NOTES: an explicit struct here rather than
//! the reference implementation's negative-offset trick off `authMode`).
//! Decode failures never propagate as `UdpstError` — they return
//! `IntegrityError` so the caller can bump a counter and drop the datagram.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::IntegrityError;
use crate::net::protocol::{CrspCode, CHNR_ID, CHSR_ID, CHTA_ID, LOAD_ID, STATUS_ID};

/// Trailing auth envelope carried by every control-plane PDU and, when
/// authentication is enabled, the data-plane PDUs too.
///
/// Field order matches the reference's on-wire tail: mode, time, digest,
/// key id, reserved, checksum — but here it is a first-class struct rather
/// than bytes reached via `AO_MODE_OFFSET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthTail {
    pub auth_mode: u8,
    pub auth_unix_time: u32,
    pub auth_digest: [u8; 32],
    pub key_id: u16,
    pub reserved_auth1: u16,
    pub check_sum: u16,
}

pub const AUTH_TAIL_LEN: usize = 1 + 4 + 32 + 2 + 2 + 2;

impl AuthTail {
    pub fn zeroed() -> Self {
        AuthTail {
            auth_mode: 0,
            auth_unix_time: 0,
            auth_digest: [0u8; 32],
            key_id: 0,
            reserved_auth1: 0,
            check_sum: 0,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.auth_mode);
        buf.put_u32(self.auth_unix_time);
        buf.put_slice(&self.auth_digest);
        buf.put_u16(self.key_id);
        buf.put_u16(self.reserved_auth1);
        buf.put_u16(self.check_sum);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, IntegrityError> {
        if buf.remaining() < AUTH_TAIL_LEN {
            return Err(IntegrityError::TooShort);
        }
        let auth_mode = buf.get_u8();
        let auth_unix_time = buf.get_u32();
        let mut auth_digest = [0u8; 32];
        buf.copy_to_slice(&mut auth_digest);
        let key_id = buf.get_u16();
        let reserved_auth1 = buf.get_u16();
        let check_sum = buf.get_u16();
        Ok(AuthTail {
            auth_mode,
            auth_unix_time,
            auth_digest,
            key_id,
            reserved_auth1,
            check_sum,
        })
    }
}

/// Ones-complement checksum over a header region, matching the reference's
/// IP-style checksum policy for pre-`EXTAUTH_PVER` peers. `check_sum` itself
/// must be zero in the input when computing (it's filled in afterward).
pub fn ones_complement_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Recompute the trailing `checkSum` field against `encoded` (the full PDU as
/// received, checksum field included as its last two bytes) and compare
/// against `claimed`. A zero `claimed` means the sender didn't opt into
/// checksum protection — skip recomputation entirely (spec.md §4.1: "a
/// non-zero checksum field triggers recomputation"). `ones_complement_checksum`
/// is insensitive to whether the checksum's own two bytes are present as
/// zero or simply absent, so recomputing over everything but those two bytes
/// is equivalent to zeroing them in place.
fn verify_trailing_checksum(encoded: &[u8], claimed: u16) -> Result<(), IntegrityError> {
    if claimed == 0 {
        return Ok(());
    }
    let body = &encoded[..encoded.len() - 2];
    if ones_complement_checksum(body) == claimed {
        Ok(())
    } else {
        Err(IntegrityError::ChecksumMismatch)
    }
}

/// CHSR setup request, client -> server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChsrRequest {
    pub protocol_ver: u16,
    pub jumbo_status: u8,
    pub traditional_mtu: bool,
    pub mc_ident: u32,
    pub mc_index: u16,
    pub mc_count: u16,
    pub auth: AuthTail,
}

pub const CHSR_REQUEST_LEN: usize = 2 + 2 + 2 + 4 + 2 + 2 + AUTH_TAIL_LEN;

impl ChsrRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CHSR_ID);
        buf.put_u16(self.protocol_ver);
        buf.put_u8(self.jumbo_status);
        buf.put_u8(self.traditional_mtu as u8);
        buf.put_u32(self.mc_ident);
        buf.put_u16(self.mc_index);
        buf.put_u16(self.mc_count);
        self.auth.encode(buf);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < CHSR_REQUEST_LEN {
            return Err(IntegrityError::TooShort);
        }
        let original = buf;
        let pdu_id = buf.get_u16();
        if pdu_id != CHSR_ID {
            return Err(IntegrityError::BadPduId);
        }
        let protocol_ver = buf.get_u16();
        let jumbo_status = buf.get_u8();
        let traditional_mtu = buf.get_u8() != 0;
        let mc_ident = buf.get_u32();
        let mc_index = buf.get_u16();
        let mc_count = buf.get_u16();
        let auth = AuthTail::decode(&mut buf)?;
        verify_trailing_checksum(original, auth.check_sum)?;
        Ok(ChsrRequest {
            protocol_ver,
            jumbo_status,
            traditional_mtu,
            mc_ident,
            mc_index,
            mc_count,
            auth,
        })
    }
}

/// CHSR setup response, server -> client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChsrResponse {
    pub protocol_ver: u16,
    pub crsp_code: u16,
    pub jumbo_status: u8,
    pub conn_id: u32,
    /// Ephemeral data-plane port the server allocated for this test
    /// (spec.md §4.4 step 4 / scenario 1). The client reconnects its
    /// datagram socket here before sending CHTA.
    pub test_port: u16,
    pub auth: AuthTail,
}

pub const CHSR_RESPONSE_LEN: usize = 2 + 2 + 2 + 1 + 4 + 2 + AUTH_TAIL_LEN;

impl ChsrResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CHSR_ID);
        buf.put_u16(self.protocol_ver);
        buf.put_u16(self.crsp_code);
        buf.put_u8(self.jumbo_status);
        buf.put_u32(self.conn_id);
        buf.put_u16(self.test_port);
        self.auth.encode(buf);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < CHSR_RESPONSE_LEN {
            return Err(IntegrityError::TooShort);
        }
        let original = buf;
        let pdu_id = buf.get_u16();
        if pdu_id != CHSR_ID {
            return Err(IntegrityError::BadPduId);
        }
        let protocol_ver = buf.get_u16();
        let crsp_code = buf.get_u16();
        let jumbo_status = buf.get_u8();
        let conn_id = buf.get_u32();
        let test_port = buf.get_u16();
        let auth = AuthTail::decode(&mut buf)?;
        verify_trailing_checksum(original, auth.check_sum)?;
        Ok(ChsrResponse {
            protocol_ver,
            crsp_code,
            jumbo_status,
            conn_id,
            test_port,
            auth,
        })
    }

    pub fn crsp(&self) -> Option<CrspCode> {
        CrspCode::from_u16(self.crsp_code)
    }
}

/// CHNR null request — firewall/NAT primer, no response expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChnrRequest {
    pub conn_id: u32,
}

pub const CHNR_REQUEST_LEN: usize = 2 + 4;

impl ChnrRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CHNR_ID);
        buf.put_u32(self.conn_id);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < CHNR_REQUEST_LEN {
            return Err(IntegrityError::TooShort);
        }
        let pdu_id = buf.get_u16();
        if pdu_id != CHNR_ID {
            return Err(IntegrityError::BadPduId);
        }
        let conn_id = buf.get_u32();
        Ok(ChnrRequest { conn_id })
    }
}

/// CHTA test-activation request, client -> server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChtaRequest {
    pub conn_id: u32,
    pub upstream: bool,
    pub low_thresh_ms: u32,
    pub upper_thresh_ms: u32,
    pub test_interval_time_s: u32,
    pub sub_interval_period_ms: u32,
    pub sr_index: u16,
    pub sr_index_is_start: bool,
    pub dscp_ecn: u8,
    pub auth: AuthTail,
}

pub const CHTA_REQUEST_LEN: usize = 2 + 4 + 1 + 4 + 4 + 4 + 4 + 2 + 1 + 1 + AUTH_TAIL_LEN;

impl ChtaRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CHTA_ID);
        buf.put_u32(self.conn_id);
        buf.put_u8(self.upstream as u8);
        buf.put_u32(self.low_thresh_ms);
        buf.put_u32(self.upper_thresh_ms);
        buf.put_u32(self.test_interval_time_s);
        buf.put_u32(self.sub_interval_period_ms);
        buf.put_u16(self.sr_index);
        buf.put_u8(self.sr_index_is_start as u8);
        buf.put_u8(self.dscp_ecn);
        self.auth.encode(buf);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < CHTA_REQUEST_LEN {
            return Err(IntegrityError::TooShort);
        }
        let original = buf;
        let pdu_id = buf.get_u16();
        if pdu_id != CHTA_ID {
            return Err(IntegrityError::BadPduId);
        }
        let conn_id = buf.get_u32();
        let upstream = buf.get_u8() != 0;
        let low_thresh_ms = buf.get_u32();
        let upper_thresh_ms = buf.get_u32();
        let test_interval_time_s = buf.get_u32();
        let sub_interval_period_ms = buf.get_u32();
        let sr_index = buf.get_u16();
        let sr_index_is_start = buf.get_u8() != 0;
        let dscp_ecn = buf.get_u8();
        let auth = AuthTail::decode(&mut buf)?;
        verify_trailing_checksum(original, auth.check_sum)?;
        Ok(ChtaRequest {
            conn_id,
            upstream,
            low_thresh_ms,
            upper_thresh_ms,
            test_interval_time_s,
            sub_interval_period_ms,
            sr_index,
            sr_index_is_start,
            dscp_ecn,
            auth,
        })
    }
}

/// CHTA test-activation response, server -> client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChtaResponse {
    pub conn_id: u32,
    pub crsp_code: u16,
    pub low_thresh_ms: u32,
    pub upper_thresh_ms: u32,
    pub test_interval_time_s: u32,
    pub sub_interval_period_ms: u32,
    pub sr_index: u16,
    pub auth: AuthTail,
}

pub const CHTA_RESPONSE_LEN: usize = 2 + 4 + 2 + 4 + 4 + 4 + 4 + 2 + AUTH_TAIL_LEN;

impl ChtaResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CHTA_ID);
        buf.put_u32(self.conn_id);
        buf.put_u16(self.crsp_code);
        buf.put_u32(self.low_thresh_ms);
        buf.put_u32(self.upper_thresh_ms);
        buf.put_u32(self.test_interval_time_s);
        buf.put_u32(self.sub_interval_period_ms);
        buf.put_u16(self.sr_index);
        self.auth.encode(buf);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < CHTA_RESPONSE_LEN {
            return Err(IntegrityError::TooShort);
        }
        let original = buf;
        let pdu_id = buf.get_u16();
        if pdu_id != CHTA_ID {
            return Err(IntegrityError::BadPduId);
        }
        let conn_id = buf.get_u32();
        let crsp_code = buf.get_u16();
        let low_thresh_ms = buf.get_u32();
        let upper_thresh_ms = buf.get_u32();
        let test_interval_time_s = buf.get_u32();
        let sub_interval_period_ms = buf.get_u32();
        let sr_index = buf.get_u16();
        let auth = AuthTail::decode(&mut buf)?;
        verify_trailing_checksum(original, auth.check_sum)?;
        Ok(ChtaResponse {
            conn_id,
            crsp_code,
            low_thresh_ms,
            upper_thresh_ms,
            test_interval_time_s,
            sub_interval_period_ms,
            sr_index,
            auth,
        })
    }

    pub fn crsp(&self) -> Option<CrspCode> {
        CrspCode::from_u16(self.crsp_code)
    }
}

/// Data-plane LOAD PDU (traffic datagram).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPdu {
    pub conn_id: u32,
    pub seq_no: u32,
    pub send_time_secs: u32,
    pub send_time_nanos: u32,
    pub train: u8,
    pub spacing_usec: u32,
    /// Wire encoding of `control::TestAction` (spec.md §4.4 Termination,
    /// scenario 6). Drives the Stop1/Stop2 graceful-stop handshake.
    pub test_action: u8,
    /// Set once this side has observed the peer's Stop1 and is
    /// acknowledging it (spec.md §8 scenario 6).
    pub rx_stopped: bool,
    pub payload_size: u32,
    /// Status PDU sequence-error count last observed by the sender.
    pub spdu_seq_err: u32,
    /// Echo of the most recent Status PDU's own tx timespec, so the
    /// receiver can compute RTT using only its own clock.
    pub rtt_tx_time_secs: u32,
    pub rtt_tx_time_nanos: u32,
    /// This side's receive timespec for the Status PDU being echoed.
    pub rtt_rx_time_secs: u32,
    pub rtt_rx_time_nanos: u32,
    pub payload: Vec<u8>,
}

pub const LOAD_HEADER_LEN: usize =
    2 + 4 + 4 + 4 + 4 + 1 + 4 + 1 + 1 + 4 + 4 + 4 + 4 + 4 + 4;

impl LoadPdu {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(LOAD_ID);
        buf.put_u32(self.conn_id);
        buf.put_u32(self.seq_no);
        buf.put_u32(self.send_time_secs);
        buf.put_u32(self.send_time_nanos);
        buf.put_u8(self.train);
        buf.put_u32(self.spacing_usec);
        buf.put_u8(self.test_action);
        buf.put_u8(self.rx_stopped as u8);
        buf.put_u32(self.payload_size);
        buf.put_u32(self.spdu_seq_err);
        buf.put_u32(self.rtt_tx_time_secs);
        buf.put_u32(self.rtt_tx_time_nanos);
        buf.put_u32(self.rtt_rx_time_secs);
        buf.put_u32(self.rtt_rx_time_nanos);
        buf.put_slice(&self.payload);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < LOAD_HEADER_LEN {
            return Err(IntegrityError::TooShort);
        }
        let pdu_id = buf.get_u16();
        if pdu_id != LOAD_ID {
            return Err(IntegrityError::BadPduId);
        }
        let conn_id = buf.get_u32();
        let seq_no = buf.get_u32();
        let send_time_secs = buf.get_u32();
        let send_time_nanos = buf.get_u32();
        let train = buf.get_u8();
        let spacing_usec = buf.get_u32();
        let test_action = buf.get_u8();
        let rx_stopped = buf.get_u8() != 0;
        let payload_size = buf.get_u32();
        let spdu_seq_err = buf.get_u32();
        let rtt_tx_time_secs = buf.get_u32();
        let rtt_tx_time_nanos = buf.get_u32();
        let rtt_rx_time_secs = buf.get_u32();
        let rtt_rx_time_nanos = buf.get_u32();
        let payload = buf.to_vec();
        Ok(LoadPdu {
            conn_id,
            seq_no,
            send_time_secs,
            send_time_nanos,
            train,
            spacing_usec,
            test_action,
            rx_stopped,
            payload_size,
            spdu_seq_err,
            rtt_tx_time_secs,
            rtt_tx_time_nanos,
            rtt_rx_time_secs,
            rtt_rx_time_nanos,
            payload,
        })
    }

    pub fn wire_len(&self) -> usize {
        LOAD_HEADER_LEN + self.payload.len()
    }
}

/// Data-plane STATUS PDU (receiver feedback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPdu {
    pub conn_id: u32,
    pub trial_int_index: u32,
    pub delay_var_usec: i32,
    pub sr_index: u16,
    pub seq_err_count: u32,
    pub loss_count: u32,
    pub ooo_count: u32,
    pub dup_count: u32,
    /// Wire encoding of `control::TestAction`, mirrored from the last
    /// Load PDU this side observed (spec.md §8 scenario 6).
    pub test_action: u8,
    pub rx_stopped: bool,
    /// This side's own tx timespec, echoed back by the sender on a
    /// later Load PDU so both sides can compute RTT from their own clock.
    pub spdu_tx_time_secs: u32,
    pub spdu_tx_time_nanos: u32,
}

pub const STATUS_PDU_LEN: usize = 2 + 4 + 4 + 4 + 2 + 4 + 4 + 4 + 4 + 1 + 1 + 4 + 4;

impl StatusPdu {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(STATUS_ID);
        buf.put_u32(self.conn_id);
        buf.put_u32(self.trial_int_index);
        buf.put_i32(self.delay_var_usec);
        buf.put_u16(self.sr_index);
        buf.put_u32(self.seq_err_count);
        buf.put_u32(self.loss_count);
        buf.put_u32(self.ooo_count);
        buf.put_u32(self.dup_count);
        buf.put_u8(self.test_action);
        buf.put_u8(self.rx_stopped as u8);
        buf.put_u32(self.spdu_tx_time_secs);
        buf.put_u32(self.spdu_tx_time_nanos);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IntegrityError> {
        if buf.len() < STATUS_PDU_LEN {
            return Err(IntegrityError::TooShort);
        }
        let pdu_id = buf.get_u16();
        if pdu_id != STATUS_ID {
            return Err(IntegrityError::BadPduId);
        }
        let conn_id = buf.get_u32();
        let trial_int_index = buf.get_u32();
        let delay_var_usec = buf.get_i32();
        let sr_index = buf.get_u16();
        let seq_err_count = buf.get_u32();
        let loss_count = buf.get_u32();
        let ooo_count = buf.get_u32();
        let dup_count = buf.get_u32();
        let test_action = buf.get_u8();
        let rx_stopped = buf.get_u8() != 0;
        let spdu_tx_time_secs = buf.get_u32();
        let spdu_tx_time_nanos = buf.get_u32();
        Ok(StatusPdu {
            conn_id,
            trial_int_index,
            delay_var_usec,
            sr_index,
            seq_err_count,
            loss_count,
            ooo_count,
            dup_count,
            test_action,
            rx_stopped,
            spdu_tx_time_secs,
            spdu_tx_time_nanos,
        })
    }
}

/// Peek the leading `pduId` of a datagram without consuming it, used to
/// dispatch to the right family-specific decoder.
pub fn peek_pdu_id(data: &[u8]) -> Result<u16, IntegrityError> {
    if data.len() < 2 {
        return Err(IntegrityError::TooShort);
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_auth() -> AuthTail {
        AuthTail {
            auth_mode: 1,
            auth_unix_time: 1_700_000_000,
            auth_digest: [7u8; 32],
            key_id: 3,
            reserved_auth1: 0,
            // Zero opts out of checksum verification so these fixtures
            // exercise plain encode/decode symmetry; checksum enforcement
            // itself is covered by the dedicated tests below.
            check_sum: 0,
        }
    }

    #[test]
    fn chsr_request_roundtrips() {
        let req = ChsrRequest {
            protocol_ver: 20,
            jumbo_status: 1,
            traditional_mtu: true,
            mc_ident: 0xDEADBEEF,
            mc_index: 2,
            mc_count: 4,
            auth: sample_auth(),
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), CHSR_REQUEST_LEN);
        let decoded = ChsrRequest::decode(&buf).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn chsr_response_roundtrips_and_resolves_crsp() {
        let resp = ChsrResponse {
            protocol_ver: 20,
            crsp_code: 0,
            jumbo_status: 0,
            conn_id: 99,
            test_port: 33445,
            auth: sample_auth(),
        };
        let mut buf = BytesMut::new();
        resp.encode(&mut buf);
        let decoded = ChsrResponse::decode(&buf).unwrap();
        assert_eq!(decoded.crsp(), Some(CrspCode::AckOk));
        assert_eq!(decoded.test_port, 33445);
    }

    #[test]
    fn chnr_request_roundtrips() {
        let req = ChnrRequest { conn_id: 5 };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(ChnrRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn chta_request_roundtrips() {
        let req = ChtaRequest {
            conn_id: 42,
            upstream: false,
            low_thresh_ms: 5,
            upper_thresh_ms: 10,
            test_interval_time_s: 10,
            sub_interval_period_ms: 1000,
            sr_index: 20,
            sr_index_is_start: true,
            dscp_ecn: 0,
            auth: sample_auth(),
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(ChtaRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn load_pdu_roundtrips_with_payload() {
        let pdu = LoadPdu {
            conn_id: 1,
            seq_no: 12345,
            send_time_secs: 1_700_000_000,
            send_time_nanos: 500,
            train: 1,
            spacing_usec: 1000,
            test_action: 1,
            rx_stopped: false,
            payload_size: 128,
            spdu_seq_err: 0,
            rtt_tx_time_secs: 1_700_000_001,
            rtt_tx_time_nanos: 250,
            rtt_rx_time_secs: 1_700_000_001,
            rtt_rx_time_nanos: 900,
            payload: vec![0xAB; 128],
        };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(buf.len(), pdu.wire_len());
        let decoded = LoadPdu::decode(&buf).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn load_pdu_roundtrips_stop1_handshake_fields() {
        let pdu = LoadPdu {
            conn_id: 1,
            seq_no: 99,
            send_time_secs: 0,
            send_time_nanos: 0,
            train: 0,
            spacing_usec: 0,
            test_action: 2, // Stop1
            rx_stopped: true,
            payload_size: 0,
            spdu_seq_err: 4,
            rtt_tx_time_secs: 0,
            rtt_tx_time_nanos: 0,
            rtt_rx_time_secs: 0,
            rtt_rx_time_nanos: 0,
            payload: vec![],
        };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        let decoded = LoadPdu::decode(&buf).unwrap();
        assert_eq!(decoded.test_action, 2);
        assert!(decoded.rx_stopped);
        assert_eq!(decoded.spdu_seq_err, 4);
    }

    #[test]
    fn status_pdu_roundtrips() {
        let pdu = StatusPdu {
            conn_id: 7,
            trial_int_index: 3,
            delay_var_usec: -250,
            sr_index: 15,
            seq_err_count: 0,
            loss_count: 2,
            ooo_count: 1,
            dup_count: 0,
            test_action: 1,
            rx_stopped: false,
            spdu_tx_time_secs: 1_700_000_002,
            spdu_tx_time_nanos: 42,
        };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(StatusPdu::decode(&buf).unwrap(), pdu);
    }

    #[test]
    fn truncated_datagram_is_too_short_not_panic() {
        let mut buf = BytesMut::new();
        buf.put_u16(STATUS_ID);
        buf.put_u8(0);
        assert_eq!(StatusPdu::decode(&buf).unwrap_err(), IntegrityError::TooShort);
    }

    #[test]
    fn mismatched_pdu_id_rejected() {
        let req = ChnrRequest { conn_id: 1 };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        // Pad so the length check passes and the id mismatch is what's exercised.
        buf.resize(CHTA_REQUEST_LEN, 0);
        assert_eq!(ChtaRequest::decode(&buf).unwrap_err(), IntegrityError::BadPduId);
    }

    #[test]
    fn peek_pdu_id_reads_leading_id() {
        let req = ChnrRequest { conn_id: 1 };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(peek_pdu_id(&buf).unwrap(), CHNR_ID);
    }

    #[test]
    fn checksum_changes_when_any_byte_flips() {
        let data = b"the quick brown fox jumps over";
        let base = ones_complement_checksum(data);
        let mut mutated = data.to_vec();
        mutated[3] ^= 0x01;
        assert_ne!(ones_complement_checksum(&mutated), base);
    }

    #[test]
    fn zero_checksum_skips_verification() {
        let req = ChsrRequest {
            protocol_ver: 20,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 1,
            mc_index: 0,
            mc_count: 1,
            auth: sample_auth(),
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        // Corrupt a body byte; a zero claimed checksum must not trigger
        // recomputation at all.
        buf[5] ^= 0xFF;
        assert!(ChsrRequest::decode(&buf).is_ok());
    }

    #[test]
    fn nonzero_checksum_is_verified_on_decode() {
        // check_sum isn't itself covered by the checksum (it's the trailing
        // 2 bytes), so encoding once with it at zero gives the exact value
        // to claim.
        let probe = ChsrRequest {
            protocol_ver: 20,
            jumbo_status: 0,
            traditional_mtu: false,
            mc_ident: 1,
            mc_index: 0,
            mc_count: 1,
            auth: sample_auth(),
        };
        let mut probe_buf = BytesMut::new();
        probe.encode(&mut probe_buf);
        let claimed = ones_complement_checksum(&probe_buf[..probe_buf.len() - 2]);

        let mut auth = sample_auth();
        auth.check_sum = claimed;
        let req = ChsrRequest { auth, ..probe };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(ChsrRequest::decode(&buf).unwrap(), req);

        buf[5] ^= 0xFF;
        assert_eq!(
            ChsrRequest::decode(&buf).unwrap_err(),
            IntegrityError::ChecksumMismatch
        );
    }

    proptest! {
        #[test]
        fn load_pdu_roundtrips_for_arbitrary_payloads(
            conn_id in any::<u32>(),
            seq_no in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..1500),
        ) {
            let pdu = LoadPdu {
                conn_id,
                seq_no,
                send_time_secs: 0,
                send_time_nanos: 0,
                train: 1,
                spacing_usec: 0,
                test_action: 1,
                rx_stopped: false,
                payload_size: 0,
                spdu_seq_err: 0,
                rtt_tx_time_secs: 0,
                rtt_tx_time_nanos: 0,
                rtt_rx_time_secs: 0,
                rtt_rx_time_nanos: 0,
                payload,
            };
            let mut buf = BytesMut::new();
            pdu.encode(&mut buf);
            let decoded = LoadPdu::decode(&buf).unwrap();
            prop_assert_eq!(decoded, pdu);
        }
    }
}
