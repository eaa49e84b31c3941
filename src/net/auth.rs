//! HMAC-SHA-256 authentication envelope: per-session key derivation (KBKDF,
//! NIST SP 800-108 counter mode) and the digest insert/validate pair applied
//! to every authenticated PDU (spec.md §4.2, C2).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;
use crate::time::unix_time_secs;

type HmacSha256 = Hmac<Sha256>;

pub const SHA256_KEY_LEN: usize = 32;
/// KDF label, fixed per spec.md §4.2.
const KDF_LABEL: &[u8] = b"UDPSTP";
/// Single zero byte separating label from context in the KBKDF input, per
/// SP 800-108 counter-mode construction.
const KDF_SEPARATOR: u8 = 0x00;
/// Trailer: requested output length in bits, as a 32-bit big-endian field —
/// `SHA256_KEY_LEN * 2 * 8` since one derivation produces both directions'
/// keys.
const KDF_OUTPUT_BITS: u32 = (SHA256_KEY_LEN * 2 * 8) as u32;

/// Window, in seconds, within which a received `authUnixTime` must fall
/// relative to the local clock for the digest check to even be attempted.
pub const AUTH_TIME_WINDOW_SECS: i64 = 30;

/// Accepted auth modes in the PDU's `authMode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMode {
    None = 0,
    HmacSha256 = 1,
}

impl AuthMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AuthMode::None),
            1 => Some(AuthMode::HmacSha256),
            _ => None,
        }
    }
}

/// A derived client/server key pair for one session, keyed by `authUnixTime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub client_key: [u8; SHA256_KEY_LEN],
    pub server_key: [u8; SHA256_KEY_LEN],
}

/// Derive a session's client/server HMAC keys from a shared key and the
/// handshake's `authUnixTime`, via two KBKDF-HMAC-SHA-256 counter-mode
/// iterations (SP 800-108): iteration input is `counter(4B BE) || label ||
/// 0x00 || context || output_len(4B BE)`, where `context` is the decimal
/// ASCII encoding of `auth_unix_time`. The two 32-byte iteration outputs are
/// concatenated and split into `client_key`/`server_key`.
pub fn derive_keys(shared_key: &[u8], auth_unix_time: u64) -> SessionKeys {
    let context = auth_unix_time.to_string();
    let mut out = Vec::with_capacity(SHA256_KEY_LEN * 2);

    for counter in 1u32..=2 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(shared_key)
            .expect("HMAC accepts keys of any length");
        mac.update(&counter.to_be_bytes());
        mac.update(KDF_LABEL);
        mac.update(&[KDF_SEPARATOR]);
        mac.update(context.as_bytes());
        mac.update(&KDF_OUTPUT_BITS.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
    }

    let mut client_key = [0u8; SHA256_KEY_LEN];
    let mut server_key = [0u8; SHA256_KEY_LEN];
    client_key.copy_from_slice(&out[0..SHA256_KEY_LEN]);
    server_key.copy_from_slice(&out[SHA256_KEY_LEN..SHA256_KEY_LEN * 2]);
    SessionKeys { client_key, server_key }
}

/// Compute the 32-byte HMAC-SHA-256 digest over `message` under `key`. The
/// caller is responsible for zeroing the digest field in `message` before
/// calling this (spec.md §4.2: "digest field zeroed during its own
/// computation").
pub fn compute_digest(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time digest comparison — never use `==` on secrets derived from
/// network input.
pub fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validate an inbound PDU's auth envelope against the given key,
/// recomputing the digest over `message_with_digest_zeroed` and checking the
/// time window, per spec.md §4.2's validation chain (mode check, time
/// window, recompute-and-compare).
pub fn validate_auth(
    mode: AuthMode,
    auth_unix_time: u64,
    claimed_digest: &[u8; 32],
    message_with_digest_zeroed: &[u8],
    key: &[u8],
    require_auth: bool,
) -> Result<(), AuthError> {
    match mode {
        AuthMode::None => {
            if require_auth {
                Err(AuthError::AuthRequired)
            } else {
                Ok(())
            }
        }
        AuthMode::HmacSha256 => {
            let now = unix_time_secs() as i64;
            let delta = now - auth_unix_time as i64;
            if delta.abs() > AUTH_TIME_WINDOW_SECS {
                return Err(AuthError::OutOfWindow);
            }
            let expected = compute_digest(key, message_with_digest_zeroed);
            if digests_equal(&expected, claimed_digest) {
                Ok(())
            } else {
                Err(AuthError::DigestMismatch)
            }
        }
    }
}
