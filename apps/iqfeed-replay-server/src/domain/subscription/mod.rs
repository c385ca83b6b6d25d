//! Subscription Registry
//!
//! Per-connection table of what a client is watching and how far replay
//! has progressed for each symbol.
//!
//! # Design
//!
//! Each connection owns exactly one registry. Nothing else reads or
//! writes it, so entries need no locking. Entries are keyed by symbol,
//! so a symbol is subscribed at most once per connection; iteration is
//! in ascending symbol order.
//!
//! A subscription tracks:
//! - The replay origin (wall instant at which virtual time is zero)
//! - The anchor (source timestamp that maps to the origin)
//! - The cursor (index of the next undelivered record)
//! - The Level 1 summary folded from delivered records

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDateTime, TimeDelta};

use crate::domain::market_data::{QuoteSummary, Record, Symbol};

// =============================================================================
// Types
// =============================================================================

/// How a subscription delivers records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Continuous Level 1 updates.
    Watch,
    /// Continuous interval bars.
    Bars {
        /// Request id echoed on every bar line.
        request_id: String,
        /// Bar interval in seconds.
        interval_secs: u32,
    },
    /// One-shot Level 1 summary, removed once answered.
    Snapshot,
}

impl SubscriptionMode {
    /// Mode name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::Bars { .. } => "bars",
            Self::Snapshot => "snapshot",
        }
    }

    /// Whether the subscription keeps delivering after its first batch.
    #[must_use]
    pub const fn is_continuous(&self) -> bool {
        !matches!(self, Self::Snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndOfData {
    NotReached,
    Pending,
    Reported,
}

/// Minimum gap inserted between the last record of a lap and the first
/// record of the next one.
const MIN_LAP_SPACING: TimeDelta = TimeDelta::seconds(1);

// =============================================================================
// Subscription
// =============================================================================

/// One symbol subscription and its replay position.
#[derive(Debug, Clone)]
pub struct Subscription {
    symbol: Symbol,
    mode: SubscriptionMode,
    records: Arc<[Record]>,
    origin: Instant,
    anchor: NaiveDateTime,
    cursor: usize,
    lap: u32,
    delivered: u64,
    end_of_data: EndOfData,
    summary: QuoteSummary,
}

impl Subscription {
    /// Create a subscription whose replay starts at `origin` from the
    /// first record of `records`.
    #[must_use]
    pub fn new(
        symbol: Symbol,
        mode: SubscriptionMode,
        records: Arc<[Record]>,
        origin: Instant,
    ) -> Self {
        let anchor = records.first().map(|r| r.timestamp).unwrap_or_default();
        Self {
            symbol,
            mode,
            records,
            origin,
            anchor,
            cursor: 0,
            lap: 0,
            delivered: 0,
            end_of_data: EndOfData::NotReached,
            summary: QuoteSummary::new(),
        }
    }

    /// Get the symbol.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Get the delivery mode.
    #[must_use]
    pub const fn mode(&self) -> &SubscriptionMode {
        &self.mode
    }

    /// Get the shared record sequence.
    #[must_use]
    pub fn records(&self) -> &Arc<[Record]> {
        &self.records
    }

    /// Wall instant at which virtual elapsed time is zero.
    #[must_use]
    pub const fn origin(&self) -> Instant {
        self.origin
    }

    /// Source timestamp corresponding to the origin.
    #[must_use]
    pub const fn anchor(&self) -> NaiveDateTime {
        self.anchor
    }

    /// Index of the next undelivered record.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of completed passes over the records (loop policy only).
    #[must_use]
    pub const fn lap(&self) -> u32 {
        self.lap
    }

    /// Total records delivered over the subscription's lifetime.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Whether there is any recorded data.
    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.records.is_empty()
    }

    /// Whether the cursor has passed the last record.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.records.len()
    }

    /// The next undelivered record.
    #[must_use]
    pub fn peek(&self) -> Option<&Record> {
        self.records.get(self.cursor)
    }

    /// Level 1 state built from delivered records.
    #[must_use]
    pub const fn summary(&self) -> &QuoteSummary {
        &self.summary
    }

    /// Mutable Level 1 state.
    pub fn summary_mut(&mut self) -> &mut QuoteSummary {
        &mut self.summary
    }

    /// Consume a pending end-of-data notification.
    ///
    /// Returns `true` exactly once per time the end is reached.
    pub fn take_end_of_data(&mut self) -> bool {
        if self.end_of_data == EndOfData::Pending {
            self.end_of_data = EndOfData::Reported;
            true
        } else {
            false
        }
    }

    /// Source-time distance from the current anchor to the first record of
    /// the next lap.
    #[must_use]
    pub fn next_lap_offset(&self) -> Option<TimeDelta> {
        let last = self.records.last()?;
        Some(last.timestamp - self.anchor + self.lap_spacing())
    }

    /// Move the origin to `origin`, re-anchoring so that `position` (in
    /// source time) maps to it. The cursor is kept.
    pub(crate) fn restart(&mut self, origin: Instant, position: NaiveDateTime) {
        self.origin = origin;
        self.anchor = position;
        self.end_of_data = EndOfData::NotReached;
    }

    pub(crate) fn advance(&mut self) -> Option<Record> {
        let record = self.records.get(self.cursor)?.clone();
        self.cursor += 1;
        self.delivered += 1;
        Some(record)
    }

    pub(crate) fn mark_end_of_data(&mut self) {
        if self.end_of_data == EndOfData::NotReached {
            self.end_of_data = EndOfData::Pending;
        }
    }

    /// Rewind to the first record and shift the anchor back by one lap so
    /// the next lap continues in source-time order.
    pub(crate) fn wrap(&mut self) {
        let (Some(first), Some(last)) = (self.records.first(), self.records.last()) else {
            return;
        };
        let lap_length = last.timestamp - first.timestamp + self.lap_spacing();
        self.anchor = self
            .anchor
            .checked_sub_signed(lap_length)
            .unwrap_or(NaiveDateTime::MIN);
        self.cursor = 0;
        self.lap = self.lap.saturating_add(1);
        self.end_of_data = EndOfData::NotReached;
    }

    /// Average spacing between records, at least `MIN_LAP_SPACING`.
    fn lap_spacing(&self) -> TimeDelta {
        let (Some(first), Some(last)) = (self.records.first(), self.records.last()) else {
            return MIN_LAP_SPACING;
        };
        let gaps = i32::try_from(self.records.len().saturating_sub(1)).unwrap_or(i32::MAX);
        if gaps == 0 {
            return MIN_LAP_SPACING;
        }
        ((last.timestamp - first.timestamp) / gaps).max(MIN_LAP_SPACING)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Statistics for a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Level 1 watches.
    pub watches: usize,
    /// Bar watches.
    pub bar_watches: usize,
    /// Outstanding snapshots.
    pub snapshots: usize,
}

impl SubscriptionStats {
    /// Total subscriptions.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.watches + self.bar_watches + self.snapshots
    }
}

/// A connection's subscriptions, keyed and ordered by symbol.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<Symbol, Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription, replacing and returning any existing one for
    /// the same symbol.
    pub fn add(&mut self, subscription: Subscription) -> Option<Subscription> {
        self.entries
            .insert(subscription.symbol().clone(), subscription)
    }

    /// Remove a subscription. Removing an absent symbol is a no-op.
    pub fn remove(&mut self, symbol: &Symbol) -> Option<Subscription> {
        self.entries.remove(symbol)
    }

    /// Remove every subscription, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<&Subscription> {
        self.entries.get(symbol)
    }

    /// Look up a subscription mutably.
    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut Subscription> {
        self.entries.get_mut(symbol)
    }

    /// Whether a symbol is subscribed.
    #[must_use]
    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscriptions in ascending symbol order.
    pub fn list(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    /// Mutable subscriptions in ascending symbol order.
    pub fn list_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.entries.values_mut()
    }

    /// Continuously watched symbols in ascending order.
    #[must_use]
    pub fn watched_symbols(&self) -> Vec<Symbol> {
        self.entries
            .values()
            .filter(|s| s.mode().is_continuous())
            .map(|s| s.symbol().clone())
            .collect()
    }

    /// Count subscriptions by mode.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.entries
            .values()
            .fold(SubscriptionStats::default(), |mut stats, s| {
                match s.mode() {
                    SubscriptionMode::Watch => stats.watches += 1,
                    SubscriptionMode::Bars { .. } => stats.bar_watches += 1,
                    SubscriptionMode::Snapshot => stats.snapshots += 1,
                }
                stats
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
