//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ReplaySession`: one client's subscriptions, command handling and replay
//! - `Heartbeat`: timestamp and keepalive scheduling

pub mod heartbeat;
pub mod session;

pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use session::{Directive, DisconnectReason, Outbound, ReplaySession, SessionSettings};
