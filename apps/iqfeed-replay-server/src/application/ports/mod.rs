//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `HistoryStore`: read-only access to recorded market data

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::domain::market_data::{Record, Symbol};

/// Shared, immutable record sequence for one symbol.
pub type RecordSeries = Arc<[Record]>;

/// History store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or read.
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be parsed.
    #[error("corrupt data for {symbol}: {message}")]
    Corrupt {
        /// Symbol whose data is corrupt.
        symbol: String,
        /// Parse failure detail.
        message: String,
    },

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only accessor over recorded market data.
///
/// Implementations must be safe to share across every connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch a symbol's records at or after `from`, ascending by timestamp.
    ///
    /// A symbol with no recorded data yields an empty series, not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store cannot answer.
    async fn fetch(
        &self,
        symbol: &Symbol,
        from: Option<NaiveDateTime>,
    ) -> Result<RecordSeries, StoreError>;

    /// Human-readable store name for logging.
    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn HistoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HistoryStore").field(&self.name()).finish()
    }
}
