//! The UDP speed-test protocol stack: wire codec, auth envelope, connection
//! table, control/data state machines, rate controller, event loop, and
//! result aggregation (spec.md §2 component table).

pub mod aggregate;
pub mod auth;
pub mod codec;
pub mod conn;
pub mod control;
pub mod data;
pub mod export;
pub mod protocol;
pub mod rate;
pub mod repository;
pub mod srate;
pub mod timer;

pub use conn::{Connection, ConnectionTable, HandlerKind, MtuOption, PerfStatsCounters};
pub use control::{Session, TestAction};
pub use export::{ExportRow, ExportWriter, FilenameContext};
pub use protocol::{CrspCode, CHNR_ID, CHSR_ID, CHTA_ID, LOAD_ID, STATUS_ID};
pub use rate::{RateAdjAlgo, RateController, StartMode, TrialClass};
pub use repository::{run_client, run_server_session, Repository, SessionHandle, SessionHooks};
