//! Market Data Types
//!
//! Recorded market data as it comes out of the history store: symbols,
//! timestamped records and their trade, quote or bar payloads.
//!
//! # Ordering
//!
//! A symbol's records form a time-ascending sequence. Records sharing a
//! timestamp keep the order they were recorded in.

mod summary;

use std::fmt;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::Serialize;

pub use summary::{QuoteSummary, SummaryChanges};

// =============================================================================
// Symbol
// =============================================================================

/// Maximum accepted symbol length.
pub const MAX_SYMBOL_LEN: usize = 64;

/// A case-normalized instrument identifier.
///
/// Symbols are trimmed and uppercased on parse. They never contain the
/// protocol's field delimiter, whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse and normalize a raw symbol.
    ///
    /// # Errors
    ///
    /// Returns `SymbolError` if the symbol is empty, too long, or contains
    /// characters that cannot appear inside a protocol field.
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(SymbolError::Empty);
        }

        if trimmed.len() > MAX_SYMBOL_LEN {
            return Err(SymbolError::TooLong(trimmed.len()));
        }

        if let Some(character) = trimmed.chars().find(|c| !is_symbol_char(*c)) {
            return Err(SymbolError::InvalidCharacter {
                symbol: trimmed.to_string(),
                character,
            });
        }

        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Get the symbol string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

const fn is_symbol_char(c: char) -> bool {
    c.is_ascii_graphic() && c != ','
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Symbol validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Symbol was empty after trimming.
    #[error("symbol cannot be empty")]
    Empty,

    /// Symbol exceeds `MAX_SYMBOL_LEN`.
    #[error("symbol length {0} exceeds maximum of {MAX_SYMBOL_LEN}")]
    TooLong(usize),

    /// Symbol contains a delimiter, whitespace or non-ASCII character.
    #[error("symbol {symbol:?} contains invalid character {character:?}")]
    InvalidCharacter {
        /// The offending symbol.
        symbol: String,
        /// The first invalid character.
        character: char,
    },
}

// =============================================================================
// Records
// =============================================================================

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    /// Trade price.
    pub price: Decimal,
    /// Trade size in shares or contracts.
    pub size: u64,
    /// Market center identifier, if recorded.
    pub market_center: Option<u16>,
    /// Trade condition codes, if recorded.
    pub conditions: Option<String>,
}

/// A top-of-book quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Best bid price.
    pub bid: Decimal,
    /// Best bid size.
    pub bid_size: u64,
    /// Best ask price.
    pub ask: Decimal,
    /// Best ask size.
    pub ask_size: u64,
}

/// An interval bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    /// Opening price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Closing (last) price.
    pub close: Decimal,
    /// Cumulative session volume at the end of the bar.
    pub total_volume: u64,
    /// Volume traded within the bar.
    pub period_volume: u64,
    /// Number of trades within the bar.
    pub num_trades: u64,
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Trade print.
    Trade(Trade),
    /// Quote update.
    Quote(Quote),
    /// Interval bar.
    Bar(Bar),
}

/// Payload kind, used for labels and CSV parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Trade print.
    Trade,
    /// Quote update.
    Quote,
    /// Interval bar.
    Bar,
}

impl RecordKind {
    /// Get the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Quote => "quote",
            Self::Bar => "bar",
        }
    }

    /// Parse a kind name, ignoring case.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trade" | "t" => Some(Self::Trade),
            "quote" | "q" => Some(Self::Quote),
            "bar" | "b" => Some(Self::Bar),
            _ => None,
        }
    }
}

/// One historical data point for a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Source timestamp (exchange time as recorded).
    pub timestamp: NaiveDateTime,
    /// Record payload.
    pub payload: Payload,
}

impl Record {
    /// Create a trade record without market center or conditions.
    #[must_use]
    pub const fn trade(timestamp: NaiveDateTime, price: Decimal, size: u64) -> Self {
        Self {
            timestamp,
            payload: Payload::Trade(Trade {
                price,
                size,
                market_center: None,
                conditions: None,
            }),
        }
    }

    /// Create a quote record.
    #[must_use]
    pub const fn quote(timestamp: NaiveDateTime, quote: Quote) -> Self {
        Self {
            timestamp,
            payload: Payload::Quote(quote),
        }
    }

    /// Create a bar record.
    #[must_use]
    pub const fn bar(timestamp: NaiveDateTime, bar: Bar) -> Self {
        Self {
            timestamp,
            payload: Payload::Bar(bar),
        }
    }

    /// Get the payload kind.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self.payload {
            Payload::Trade(_) => RecordKind::Trade,
            Payload::Quote(_) => RecordKind::Quote,
            Payload::Bar(_) => RecordKind::Bar,
        }
    }
}

/// Stable-sort records by timestamp, keeping recorded order for ties.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by_key(|r| r.timestamp);
}

// =============================================================================
// Tests
// =============================================================================
