//! Feed Server
//!
//! TCP transport for the replay engine:
//!
//! - `listener`: accepts sockets and enforces the connection limit
//! - `connection`: per-client state machine and command loop
//! - `outbound`: bounded output queue and socket writer

pub mod connection;
pub mod listener;
pub mod outbound;

pub use connection::{
    Connection, ConnectionContext, SessionError, SessionState, SessionSummary,
};
pub use listener::{ReplayServer, ServerError, ServerStats};
pub use outbound::{OutboundQueue, run_writer};
