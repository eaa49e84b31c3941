//! Authenticated UDP throughput/delay measurement: control-plane handshake,
//! per-connection data-plane state machine, adaptive rate controller, and
//! HMAC-SHA-256 authentication envelope.

pub mod config;
pub mod error;
pub mod net;
pub mod time;

pub use config::{ServerConfig, TestConfig};
pub use error::{AuthError, IntegrityError, ProtocolError, ResourceError, UdpstError};
pub use net::{
    run_client, run_server_session, ConnectionTable, CrspCode, ExportRow, ExportWriter,
    FilenameContext, RateAdjAlgo, Repository, Session, SessionHandle, SessionHooks,
};
pub use time::{Deadline, SystemClock};
