//! Crate-wide error taxonomy (spec.md §7).
//!
//! Integrity failures on the wire are never surfaced as `Err` — they are
//! silently dropped and counted (see `net::conn::PerfStatsCounters`) per the
//! protocol's decode-error policy. `UdpstError` covers everything that *does*
//! propagate: control-plane rejections, auth failures, resource exhaustion,
//! watchdog timeouts, and fatal local I/O.

use crate::net::protocol::CrspCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UdpstError {
    #[error("protocol mismatch: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("resource exhausted: {0}")]
    Resource(#[from] ResourceError),

    #[error("watchdog timeout: no traffic for {0}s")]
    Timeout(u64),

    #[error("peer rejected request: {0:?}")]
    PeerRejected(CrspCode),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol version {got} outside supported range [{min}, {max}]")]
    BadVersion { got: u16, min: u16, max: u16 },
    #[error("jumbo/traditional-MTU option mismatch")]
    BadJumboSetting,
    #[error("multi-connection parameters invalid (mcIndex/mcCount)")]
    InvalidMcParams,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("HMAC digest mismatch")]
    DigestMismatch,
    #[error("authUnixTime outside the allowed window")]
    OutOfWindow,
    #[error("authentication required but mode was unauthenticated")]
    AuthRequired,
    #[error("no key available for keyId {0}")]
    UnknownKeyId(u16),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("connection table exhausted (max {0} connections)")]
    ConnectionTableFull(usize),
    #[error("requested bandwidth exceeds configured cap")]
    BandwidthCapExceeded,
    #[error("socket bind/connect failed")]
    SocketSetup,
}

/// Decode-time integrity failures. Never propagated as `UdpstError` — the
/// codec returns these so the caller can bump `PerfStatsCounters` and drop
/// the datagram, per spec.md §4.1/§7.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("datagram shorter than the minimum PDU size")]
    TooShort,
    #[error("datagram longer than the maximum PDU size")]
    TooLong,
    #[error("unrecognized pduId")]
    BadPduId,
    #[error("unknown cmdRequest/cmdResponse code")]
    BadCommand,
    #[error("header checksum mismatch")]
    ChecksumMismatch,
}
