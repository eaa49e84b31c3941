//! Per-datagram CSV export (spec.md §6 Persisted state).
//!
//! Written with plain `std::fs`/`std::io::Write`, matching the teacher's
//! direct-filesystem persistence style (`BanList::save`/`load`) rather than
//! a dependency on a CSV crate — the corpus does not carry one for this
//! domain, and the format here is a fixed, small column set.

use std::fs::File;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::net::codec::LoadPdu;

const COLUMNS: &[&str] = &[
    "SeqNo",
    "PayLoad",
    "SrcTxTime",
    "DstRxTime",
    "OWD",
    "IntfMbps",
    "IntfMbpsAlt",
    "RTTTxTime",
    "RTTRxTime",
    "RTTRespDelay",
    "RTT",
    "StatusLoss",
];

/// One row of the per-PDU export, in spec.md §6's literal column order.
///
/// `RTTTxTime`/`RTTRxTime` are the Load PDU's echoed Status-PDU tx/rx
/// timespec pair (spec.md §4.5); `RTTRespDelay` is the sender's own
/// processing delay between receiving that Status and emitting this Load,
/// computed entirely in the sender's clock domain; `RTT` is computed
/// entirely in this (the receiver's) clock domain, comparing the echoed
/// `RTTTxTime` against this row's own `DstRxTime` — neither figure requires
/// the two peers' clocks to be synchronized. A Load PDU with no RTT probe
/// in flight yet (all-zero echo fields) reports zero for all four, same as
/// the reference reports an unset `rttSample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportRow {
    pub seq_no: u32,
    pub payload_len: u32,
    pub src_tx_time_usec: i64,
    pub dst_rx_time_usec: i64,
    pub owd_usec: i64,
    /// Instantaneous rate implied by this datagram's payload size over its
    /// train's configured spacing.
    pub intf_mbps: u32,
    /// Alternate estimate including the wire header overhead the primary
    /// figure omits (reference's `IntfMbpsAlt`, UDP+IP overhead bytes).
    pub intf_mbps_alt: u32,
    pub rtt_tx_time_usec: i64,
    pub rtt_rx_time_usec: i64,
    pub rtt_resp_delay_usec: i64,
    pub rtt_usec: i64,
    /// The receiver's running loss count as of this datagram, i.e. the
    /// `StatusLoss` the next Status PDU would report.
    pub status_loss: u32,
}

impl ExportRow {
    /// Build a row from a just-received Load PDU, the receive time, and the
    /// receiver's per-connection OWD/rate bookkeeping. RTT fields are left
    /// zeroed: see the struct doc comment.
    pub fn from_received(pdu: &LoadPdu, dst_rx_time_usec: i64, owd_usec: i64, status_loss: u32) -> Self {
        let src_tx_time_usec =
            pdu.send_time_secs as i64 * 1_000_000 + (pdu.send_time_nanos / 1_000) as i64;
        let bits = pdu.wire_len() as u64 * 8;
        let intf_mbps = instantaneous_mbps(bits, pdu.spacing_usec);
        // UDP (8) + IPv4 (20) header bytes the primary figure leaves out.
        let alt_bits = (pdu.wire_len() as u64 + 28) * 8;
        let intf_mbps_alt = instantaneous_mbps(alt_bits, pdu.spacing_usec);

        // An all-zero echo means no RTT probe had completed yet when this
        // Load PDU went out.
        let has_rtt_sample = pdu.rtt_tx_time_secs != 0 || pdu.rtt_tx_time_nanos != 0;
        let rtt_tx_time_usec =
            pdu.rtt_tx_time_secs as i64 * 1_000_000 + (pdu.rtt_tx_time_nanos / 1_000) as i64;
        let rtt_rx_time_usec =
            pdu.rtt_rx_time_secs as i64 * 1_000_000 + (pdu.rtt_rx_time_nanos / 1_000) as i64;
        let (rtt_tx_time_usec, rtt_rx_time_usec, rtt_resp_delay_usec, rtt_usec) = if has_rtt_sample {
            (
                rtt_tx_time_usec,
                rtt_rx_time_usec,
                src_tx_time_usec - rtt_rx_time_usec,
                dst_rx_time_usec - rtt_tx_time_usec,
            )
        } else {
            (0, 0, 0, 0)
        };

        ExportRow {
            seq_no: pdu.seq_no,
            payload_len: pdu.payload.len() as u32,
            src_tx_time_usec,
            dst_rx_time_usec,
            owd_usec,
            intf_mbps,
            intf_mbps_alt,
            rtt_tx_time_usec,
            rtt_rx_time_usec,
            rtt_resp_delay_usec,
            rtt_usec,
            status_loss,
        }
    }
}

fn instantaneous_mbps(bits: u64, spacing_usec: u32) -> u32 {
    if spacing_usec == 0 {
        return 0;
    }
    (bits * 1_000_000 / spacing_usec as u64 / 1_000_000) as u32
}

/// Per-connection facts the `#`-token filename scheme substitutes, matching
/// spec.md §6's `#i,#c,#I,#l,#r,#s,#d,#M,#D,#H,#p,#E` table.
#[derive(Debug, Clone)]
pub struct FilenameContext {
    pub mc_index: u16,
    pub mc_count: u16,
    pub mc_ident: u32,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// `true` for the server role (`S`), `false` for the client (`C`).
    pub is_server: bool,
    /// `true` if this connection is an upstream (client-sends) test (`U`),
    /// `false` for downstream (`D`).
    pub upstream: bool,
    pub host: String,
    pub control_port: u16,
    pub interface: String,
}

/// Substitute spec.md §6's `#`-tokens against `ctx`, then run `strftime`
/// over the result against `at`. Token order: `#i` mc index, `#c` mc count,
/// `#I` mc ident, `#l` local IP, `#r` remote IP, `#s` src port, `#d` dst
/// port, `#M` mode (S/C), `#D` direction (U/D), `#H` host, `#p` control
/// port, `#E` interface.
pub fn expand_filename_tokens(pattern: &str, ctx: &FilenameContext, at: DateTime<Local>) -> String {
    let substituted = substitute_tokens(pattern, ctx);
    at.format(&substituted).to_string()
}

fn substitute_tokens(pattern: &str, ctx: &FilenameContext) -> String {
    let mode = if ctx.is_server { "S" } else { "C" };
    let direction = if ctx.upstream { "U" } else { "D" };
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '#' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('i') => out.push_str(&ctx.mc_index.to_string()),
            Some('c') => out.push_str(&ctx.mc_count.to_string()),
            Some('I') => out.push_str(&ctx.mc_ident.to_string()),
            Some('l') => out.push_str(&ctx.local_ip.to_string()),
            Some('r') => out.push_str(&ctx.remote_ip.to_string()),
            Some('s') => out.push_str(&ctx.src_port.to_string()),
            Some('d') => out.push_str(&ctx.dst_port.to_string()),
            Some('M') => out.push_str(mode),
            Some('D') => out.push_str(direction),
            Some('H') => out.push_str(&ctx.host),
            Some('p') => out.push_str(&ctx.control_port.to_string()),
            Some('E') => out.push_str(&ctx.interface),
            // Unknown token: leave the literal `#x` in place rather than
            // silently eating an unrelated `#`.
            Some(other) => {
                out.push('#');
                out.push(other);
            }
            None => out.push('#'),
        }
    }
    out
}

pub struct ExportWriter {
    file: File,
}

impl ExportWriter {
    /// Open (creating/truncating) the export file at `path`, writing the
    /// header row immediately.
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "{}", COLUMNS.join(","))?;
        Ok(ExportWriter { file })
    }

    /// Resolve a filename pattern's `#`-tokens and strftime fields, then
    /// open the resulting path.
    pub fn create_with_pattern(
        dir: &Path,
        pattern: &str,
        ctx: &FilenameContext,
        at: DateTime<Local>,
    ) -> io::Result<(Self, PathBuf)> {
        let name = expand_filename_tokens(pattern, ctx, at);
        let path = dir.join(name);
        let writer = Self::create(&path)?;
        Ok((writer, path))
    }

    pub fn write_row(&mut self, row: &ExportRow) -> io::Result<()> {
        writeln!(
            self.file,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            row.seq_no,
            row.payload_len,
            row.src_tx_time_usec,
            row.dst_rx_time_usec,
            row.owd_usec,
            row.intf_mbps,
            row.intf_mbps_alt,
            row.rtt_tx_time_usec,
            row.rtt_rx_time_usec,
            row.rtt_resp_delay_usec,
            row.rtt_usec,
            row.status_loss,
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
