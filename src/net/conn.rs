//! Connection table and per-connection state (spec.md §3, §4.3, C3).
//!
//! Slots are allocated by linear scan for a free entry (`fd == -1` in the
//! reference; here `socket.is_none()`), matching the teacher's flat
//! `Vec`-backed table style (`net::connection::ConnectionManager`) rather
//! than a generational arena — the table is small and bounded by
//! `ServerConfig::max_connections`.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, TestConfig};
use crate::error::{ResourceError, UdpstError};
use crate::net::auth::SessionKeys;
use crate::net::rate::{RateController, SrIndex};

/// Which handler a connection's primary/secondary slot dispatches to.
/// A flat enum, not a trait object: the set of handler kinds is small and
/// fixed, and the event loop is single-threaded, so there is no dynamic
/// dispatch to buy here (spec.md §9 DESIGN NOTES).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Awaiting CHSR/CHTA from a client; server-side only.
    ControlListener,
    /// Active control-plane session (post-CHSR, pre/post-CHTA).
    Control,
    /// Active data-plane sender.
    DataSender,
    /// Active data-plane receiver.
    DataReceiver,
}

/// Per-connection state. One instance per accepted client, indexed by its
/// slot in `ConnectionTable`.
pub struct Connection {
    pub conn_id: u32,
    pub peer_addr: SocketAddr,
    pub socket: Option<UdpSocket>,
    pub primary: Option<HandlerKind>,
    pub secondary: Option<HandlerKind>,
    pub test_config: TestConfig,
    pub session_keys: Option<SessionKeys>,
    pub rate: Option<RateController>,
    /// DSCP+ECN byte negotiated for this connection's data-plane socket.
    pub ip_tos: u8,
    pub mtu: MtuOption,
    /// `mcIdent`/`mcIndex`/`mcCount` from CHSR, for multi-connection tests.
    pub mc_ident: u32,
    pub mc_index: u16,
    pub mc_count: u16,
    pub stats: PerfStatsCounters,
}

/// Jumbo/traditional-MTU negotiation result (spec.md §3 supplemental,
/// `original_source/udpst-win.cpp` jumbo handling). Advisory only here: it
/// clamps payload sizing but this implementation has no path-MTU probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuOption {
    Traditional,
    Jumbo,
}

/// Decode-error and loss tallies accumulated on a connection, incremented
/// directly rather than routed through `UdpstError` (spec.md §7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStatsCounters {
    pub too_short: u64,
    pub too_long: u64,
    pub bad_pdu_id: u64,
    pub bad_command: u64,
    pub checksum_mismatch: u64,
    pub auth_failures: u64,
    pub sequence_errors: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub duplicate: u64,
}

impl Connection {
    fn vacant(conn_id: u32) -> Self {
        Connection {
            conn_id,
            peer_addr: "0.0.0.0:0".parse().unwrap(),
            socket: None,
            primary: None,
            secondary: None,
            test_config: TestConfig::default(),
            session_keys: None,
            rate: None,
            ip_tos: 0,
            mtu: MtuOption::Traditional,
            mc_ident: 0,
            mc_index: 0,
            mc_count: 1,
            stats: PerfStatsCounters::default(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.socket.is_none()
    }

    pub fn start_index(&self) -> SrIndex {
        self.rate.as_ref().map(|r| r.index()).unwrap_or(0)
    }
}

/// Fixed-capacity connection table. A slot is free iff its `socket` is
/// `None`, mirroring the reference's `fd == -1` sentinel.
pub struct ConnectionTable {
    slots: Vec<Connection>,
    max_conn_index: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|i| Connection::vacant(i as u32)).collect();
        ConnectionTable { slots, max_conn_index: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, conn_id: u32) -> Option<&Connection> {
        self.slots.get(conn_id as usize)
    }

    pub fn get_mut(&mut self, conn_id: u32) -> Option<&mut Connection> {
        self.slots.get_mut(conn_id as usize)
    }

    /// Allocate a free slot for a new connection from `peer_addr`, binding a
    /// fresh UDP socket for it (spec.md §3: `new_conn`).
    pub async fn new_conn(
        &mut self,
        peer_addr: SocketAddr,
        server: &ServerConfig,
    ) -> Result<u32, UdpstError> {
        let slot = self
            .slots
            .iter()
            .position(Connection::is_free)
            .ok_or_else(|| ResourceError::ConnectionTableFull(self.slots.len()))?;

        let socket = bind_connection_socket(peer_addr, server)
            .await
            .map_err(|_| ResourceError::SocketSetup)?;

        let conn = &mut self.slots[slot];
        conn.peer_addr = peer_addr;
        conn.socket = Some(socket);
        conn.primary = Some(HandlerKind::Control);
        conn.secondary = None;
        conn.stats = PerfStatsCounters::default();

        if slot > self.max_conn_index {
            self.max_conn_index = slot;
        }
        info!(conn_id = slot, peer = %peer_addr, "allocated connection slot");
        Ok(slot as u32)
    }

    /// Finish bringing up a connection after CHTA negotiation: attach the
    /// negotiated `TestConfig`, session keys (if authenticated), and starting
    /// rate controller (spec.md §3: `init_conn`).
    pub fn init_conn(
        &mut self,
        conn_id: u32,
        test_config: TestConfig,
        session_keys: Option<SessionKeys>,
        rate: RateController,
    ) -> Result<(), UdpstError> {
        let conn = self
            .get_mut(conn_id)
            .ok_or(ResourceError::SocketSetup)?;
        conn.test_config = test_config;
        conn.session_keys = session_keys;
        conn.rate = Some(rate);
        conn.primary = Some(if conn.test_config.upstream {
            HandlerKind::DataReceiver
        } else {
            HandlerKind::DataSender
        });
        debug!(conn_id, "connection initialized for data phase");
        Ok(())
    }

    /// Release a slot back to the free pool, dropping its socket and state.
    pub fn release(&mut self, conn_id: u32) {
        if let Some(conn) = self.slots.get_mut(conn_id as usize) {
            if conn.socket.is_some() {
                warn!(conn_id, "releasing connection slot");
            }
            *conn = Connection::vacant(conn_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|c| !c.is_free()).count()
    }
}

pub(crate) async fn bind_connection_socket(
    peer_addr: SocketAddr,
    server: &ServerConfig,
) -> std::io::Result<UdpSocket> {
    let domain = if peer_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    if domain == Domain::IPV6 {
        sock.set_only_v6(server.v6only)?;
    }
    if let Some(n) = server.send_buffer_bytes {
        sock.set_send_buffer_size(n)?;
    }
    if let Some(n) = server.recv_buffer_bytes {
        sock.set_recv_buffer_size(n)?;
    }
    let any_addr: SocketAddr = if peer_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    sock.bind(&any_addr.into())?;
    let std_socket: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_socket)
}

/// Apply a DSCP+ECN byte to a bound socket. IPv4 uses `IP_TOS`; IPv6's
/// traffic-class equivalent is set the same way through `socket2`.
pub fn set_ip_tos(socket: &UdpSocket, tos: u8) -> std::io::Result<()> {
    let sock2 = socket2::SockRef::from(socket);
    sock2.set_tos(tos as u32)
}
