//! Wire-level identifiers: PDU ids, protocol version bounds, and the
//! command-response vocabulary exchanged in CHSR/CHTA.
//!
//! Values are taken verbatim from the reference implementation's
//! `udpst_protocol.h` so that this crate interoperates with it on the wire.

/// Setup request/response PDU id.
pub const CHSR_ID: u16 = 0xACE1;
/// Null request PDU id (firewall/NAT primer, no response expected).
pub const CHNR_ID: u16 = 0xDEAD;
/// Test-activation request/response PDU id.
pub const CHTA_ID: u16 = 0xACE2;
/// Data-plane load (traffic) PDU id.
pub const LOAD_ID: u16 = 0xBEEF;
/// Data-plane status (feedback) PDU id.
pub const STATUS_ID: u16 = 0xFEED;

/// Current protocol version this crate speaks.
pub const PROTOCOL_VER: u16 = 20;
/// Oldest protocol version this crate will still interoperate with.
pub const PROTOCOL_MIN: u16 = 11;

/// Minimum version at which sub-interval period is refinable via the
/// control channel (`MSSUBINT` capability).
pub const MSSUBINT_PVER: u16 = 20;
/// Minimum version that understands the explicit auth tail struct rather
/// than a raw trailing byte blob (`EXTAUTH` capability).
pub const EXTAUTH_PVER: u16 = 20;
/// Minimum version that understands sending-rate table suppression
/// (`SRASUPP` capability; server omits the table echo once the client has it
/// cached).
pub const SRASUPP_PVER: u16 = 20;
/// Minimum version at which the server primes NAT/firewall state with a
/// `CHNR` null request sent from the newly allocated test port.
pub const CHNR_PVER: u16 = 20;

/// Byte offset, counted backward from `authMode`, at which the auth tail
/// begins in a pre-`EXTAUTH_PVER` PDU. Kept only to interpret datagrams from
/// peers below `EXTAUTH_PVER`; current-version PDUs use an explicit struct
/// (spec.md §9 DESIGN NOTES) instead of offset arithmetic.
pub const AO_MODE_OFFSET: isize = 3;

/// Command-response codes carried in CHSR/CHTA response PDUs.
///
/// CHSR uses the full set; CHTA uses only `AckOk`/`BadParam` plus whichever
/// auth-related codes apply to test activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CrspCode {
    /// Request accepted.
    AckOk = 0,
    /// Protocol version outside the responder's supported range.
    BadVer = 1,
    /// Jumbo/traditional-MTU option mismatch.
    BadJs = 2,
    /// Authentication not configured on the responder but the request
    /// carried auth fields.
    AuthNc = 3,
    /// Authentication required but the request was unauthenticated.
    AuthReq = 4,
    /// Auth fields present but structurally invalid (unknown keyId, etc.).
    AuthInv = 5,
    /// HMAC digest did not match.
    AuthFail = 6,
    /// `authUnixTime` fell outside the accepted window.
    AuthTime = 7,
    /// No bandwidth available to satisfy the request at all.
    NoMaxBw = 8,
    /// Requested bandwidth exceeds the configured cap.
    CapExc = 9,
    /// Traditional-MTU request incompatible with jumbo-only responder (or
    /// vice versa).
    BadTMtu = 10,
    /// Multi-connection parameters (`mcIndex`/`mcCount`) invalid.
    McInvPar = 11,
    /// Connection table full or socket setup failed.
    ConnFail = 12,
    /// CHTA-only: a numeric test parameter was out of range.
    BadParam = 13,
}

impl CrspCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        use CrspCode::*;
        Some(match v {
            0 => AckOk,
            1 => BadVer,
            2 => BadJs,
            3 => AuthNc,
            4 => AuthReq,
            5 => AuthInv,
            6 => AuthFail,
            7 => AuthTime,
            8 => NoMaxBw,
            9 => CapExc,
            10 => BadTMtu,
            11 => McInvPar,
            12 => ConnFail,
            13 => BadParam,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        matches!(self, CrspCode::AckOk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_ids_match_reference_values() {
        assert_eq!(CHSR_ID, 0xACE1);
        assert_eq!(CHNR_ID, 0xDEAD);
        assert_eq!(CHTA_ID, 0xACE2);
        assert_eq!(LOAD_ID, 0xBEEF);
        assert_eq!(STATUS_ID, 0xFEED);
    }

    #[test]
    fn crsp_code_roundtrips_through_u16() {
        for raw in 0u16..=13 {
            let code = CrspCode::from_u16(raw).expect("known code");
            assert_eq!(code as u16, raw);
        }
        assert!(CrspCode::from_u16(14).is_none());
    }

    #[test]
    fn only_ack_ok_is_ok() {
        assert!(CrspCode::AckOk.is_ok());
        assert!(!CrspCode::BadVer.is_ok());
    }
}
