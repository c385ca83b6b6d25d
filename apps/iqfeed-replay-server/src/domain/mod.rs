//! Domain Layer - Core replay types and business logic.
//!
//! This layer contains the market data model, the feed protocol's typed
//! commands and messages, per-connection subscription state and replay
//! pacing. Nothing here performs I/O.

/// Recorded market data (symbols, records, Level 1 summaries).
pub mod market_data;

/// Typed feed protocol commands and messages.
pub mod protocol;

/// Replay clock and pacer.
pub mod replay;

/// Subscription tracking per connection.
pub mod subscription;
