//! Feed Protocol Types
//!
//! Typed client commands and server messages of the Level 1 feed
//! protocol. The text encoding of these lives in
//! `infrastructure::iqfeed::codec`.

use chrono::NaiveDateTime;

use crate::domain::market_data::{Bar, QuoteSummary, Symbol, SummaryChanges};

// =============================================================================
// Inbound
// =============================================================================

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connection handshake (`S,CONNECT`).
    Connect,
    /// Client is done; flush and close (`S,DISCONNECT`).
    Disconnect,
    /// Protocol version negotiation.
    SetProtocol(String),
    /// Continuous Level 1 watch.
    Watch(Symbol),
    /// Stop a watch of any kind.
    Unwatch(Symbol),
    /// Stop every watch on the connection.
    UnwatchAll,
    /// One-shot Level 1 summary.
    Snapshot(Symbol),
    /// Continuous interval bar watch.
    WatchBars(BarWatch),
    /// List the symbols currently watched.
    RequestWatches,
    /// Toggle the `T` timestamp heartbeat.
    Timestamps(bool),
    /// Ask for the Level 1 update field names.
    RequestUpdateFieldnames,
    /// Recognized command the emulator does not implement.
    Unsupported(String),
}

impl Command {
    /// Short command name for logging and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SetProtocol(_) => "set_protocol",
            Self::Watch(_) => "watch",
            Self::Unwatch(_) => "unwatch",
            Self::UnwatchAll => "unwatch_all",
            Self::Snapshot(_) => "snapshot",
            Self::WatchBars(_) => "watch_bars",
            Self::RequestWatches => "request_watches",
            Self::Timestamps(_) => "timestamps",
            Self::RequestUpdateFieldnames => "request_update_fieldnames",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// Parameters of an interval bar watch (`BW`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarWatch {
    /// Watched symbol.
    pub symbol: Symbol,
    /// Bar interval in seconds.
    pub interval_secs: u32,
    /// Replay start in source time, if the client asked for backfill.
    pub begin: Option<NaiveDateTime>,
    /// Request id echoed as the first field of every bar line.
    pub request_id: String,
}

impl BarWatch {
    /// The request id the feed assigns when the client supplies none.
    #[must_use]
    pub fn default_request_id(symbol: &Symbol, interval_secs: u32) -> String {
        format!("B-{symbol}-{interval_secs:04}-s")
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Level 1 message flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level1Kind {
    /// Summary message (`P`), sent for snapshots.
    Summary,
    /// Update message (`Q`), sent as records replay.
    Update,
}

/// A server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `S,SERVER CONNECTED`.
    ServerConnected,
    /// Protocol version acknowledgement.
    CurrentProtocol(String),
    /// Currently watched symbols.
    Watches(Vec<Symbol>),
    /// Level 1 update field names.
    UpdateFieldnames,
    /// Acknowledges a recognized but unimplemented command.
    Unsupported(String),
    /// Symbol unknown or without recorded data.
    NotFound(Symbol),
    /// Replay reached the end of the recorded data.
    EndOfData(Symbol),
    /// Records were dropped because the client fell behind.
    Gap {
        /// Number of dropped record lines.
        dropped: u64,
    },
    /// Connection limit reached.
    ServerBusy,
    /// The history store could not answer for a symbol.
    StoreUnavailable(Symbol),
    /// Malformed client input.
    ProtocolError(String),
    /// Sent before closing a connection over the malformed-input threshold.
    TooManyErrors,
    /// `T` heartbeat carrying server wall time.
    Timestamp(NaiveDateTime),
    /// Level 1 summary or update.
    Level1 {
        /// Summary or update.
        kind: Level1Kind,
        /// Symbol.
        symbol: Symbol,
        /// Current Level 1 state.
        summary: Box<QuoteSummary>,
        /// Fields changed by the record that produced this message.
        changes: SummaryChanges,
    },
    /// Interval bar update.
    Bar {
        /// Request id from the bar watch.
        request_id: String,
        /// Symbol.
        symbol: Symbol,
        /// Bar timestamp.
        timestamp: NaiveDateTime,
        /// Bar values.
        bar: Bar,
    },
}

impl Message {
    /// Short message name for metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Level1 {
                kind: Level1Kind::Update,
                ..
            } => "level1_update",
            Self::Level1 {
                kind: Level1Kind::Summary,
                ..
            } => "level1_summary",
            Self::Bar { .. } => "bar",
            Self::Timestamp(_) => "timestamp",
            Self::ProtocolError(_) | Self::TooManyErrors => "error",
            Self::NotFound(_) => "not_found",
            _ => "status",
        }
    }
}
