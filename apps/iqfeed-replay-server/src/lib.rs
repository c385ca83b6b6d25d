#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! IQFeed Replay Server - Historical Market Data Feed Emulator
//!
//! A TCP server that speaks the IQFeed Level 1 line protocol and replays
//! recorded market data as if it were arriving live. Trading clients and
//! their tests connect to it exactly as they would to a real feed.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Replay types and pacing rules
//!   - `market_data`: Symbols, records and Level 1 summaries
//!   - `protocol`: Typed client commands and server messages
//!   - `subscription`: Per-connection subscription registry
//!   - `replay`: Clock abstraction and the replay pacer
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The read-only `HistoryStore`
//!   - `services`: Replay sessions and heartbeats
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `iqfeed`: Line framing and the command/message codec
//!   - `store`: CSV directory and in-memory history stores
//!   - `server`: TCP listener, connections and outbound queues
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                       +----------------+
//! CSV files --fetch---> | ReplaySession  | --Outbound--> OutboundQueue --> socket
//!                       |  (per client)  |
//! client lines -parse-> |  Pacer + Clock |
//!                       +----------------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Replay types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{Record, Symbol};
pub use domain::protocol::{Command, Message};
pub use domain::replay::{Clock, EndOfDataPolicy, ManualClock, Pacer, SystemClock};

// Application
pub use application::ports::{HistoryStore, RecordSeries, StoreError};
pub use application::services::{DisconnectReason, ReplaySession, SessionSettings};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, ConnectionSettings, ListenerSettings, ReplaySettings, ServerConfig,
};

// Stores
pub use infrastructure::store::{CsvDirectoryStore, InMemoryStore};

// Feed server (for integration tests)
pub use infrastructure::server::{
    Connection, ConnectionContext, ReplayServer, ServerError, ServerStats, SessionSummary,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
