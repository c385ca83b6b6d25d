//! Running Level 1 state folded from replayed records.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use super::{Bar, Payload, Quote, Record, Trade};

/// Level 1 summary for one symbol: last trade, top of book and session range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteSummary {
    /// Most recent trade price.
    pub last: Option<Decimal>,
    /// Most recent trade size.
    pub last_size: Option<u64>,
    /// Most recent trade time.
    pub last_time: Option<NaiveDateTime>,
    /// Most recent trade market center.
    pub market_center: Option<u16>,
    /// Most recent trade conditions.
    pub conditions: Option<String>,
    /// Cumulative session volume.
    pub total_volume: u64,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best bid size.
    pub bid_size: Option<u64>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Best ask size.
    pub ask_size: Option<u64>,
    /// Session open.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
}

/// Which summary fields a record changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SummaryChanges {
    /// A trade (or bar close) updated the last price.
    pub trade: bool,
    /// The session open was set.
    pub open: bool,
    /// A new session high.
    pub high: bool,
    /// A new session low.
    pub low: bool,
    /// Cumulative volume changed.
    pub volume: bool,
    /// Bid price or size changed.
    pub bid: bool,
    /// Ask price or size changed.
    pub ask: bool,
}

impl QuoteSummary {
    /// Create an empty summary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a record into the summary and report what changed.
    pub fn apply(&mut self, record: &Record) -> SummaryChanges {
        match &record.payload {
            Payload::Trade(trade) => self.apply_trade(record.timestamp, trade),
            Payload::Quote(quote) => self.apply_quote(quote),
            Payload::Bar(bar) => self.apply_bar(record.timestamp, bar),
        }
    }

    /// Whether any trade or quote has been folded in yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last.is_none() && self.bid.is_none() && self.ask.is_none()
    }

    fn apply_trade(&mut self, timestamp: NaiveDateTime, trade: &Trade) -> SummaryChanges {
        let mut changes = SummaryChanges {
            trade: true,
            volume: trade.size > 0,
            ..SummaryChanges::default()
        };

        self.last = Some(trade.price);
        self.last_size = Some(trade.size);
        self.last_time = Some(timestamp);
        self.market_center = trade.market_center;
        self.conditions.clone_from(&trade.conditions);
        self.total_volume = self.total_volume.saturating_add(trade.size);
        self.extend_range(trade.price, trade.price, trade.price, &mut changes);

        changes
    }

    fn apply_quote(&mut self, quote: &Quote) -> SummaryChanges {
        let changes = SummaryChanges {
            bid: self.bid != Some(quote.bid) || self.bid_size != Some(quote.bid_size),
            ask: self.ask != Some(quote.ask) || self.ask_size != Some(quote.ask_size),
            ..SummaryChanges::default()
        };

        self.bid = Some(quote.bid);
        self.bid_size = Some(quote.bid_size);
        self.ask = Some(quote.ask);
        self.ask_size = Some(quote.ask_size);

        changes
    }

    fn apply_bar(&mut self, timestamp: NaiveDateTime, bar: &Bar) -> SummaryChanges {
        let mut changes = SummaryChanges {
            trade: true,
            volume: bar.total_volume != self.total_volume,
            ..SummaryChanges::default()
        };

        // Bar volume is already cumulative for the session.
        self.last = Some(bar.close);
        self.last_size = Some(bar.period_volume);
        self.last_time = Some(timestamp);
        self.total_volume = bar.total_volume;
        self.extend_range(bar.open, bar.high, bar.low, &mut changes);

        changes
    }

    fn extend_range(
        &mut self,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        changes: &mut SummaryChanges,
    ) {
        if self.open.is_none() {
            self.open = Some(open);
            changes.open = true;
        }

        if self.high.is_none_or(|h| high > h) {
            self.high = Some(high);
            changes.high = true;
        }

        if self.low.is_none_or(|l| low < l) {
            self.low = Some(low);
            changes.low = true;
        }
    }
}
