//! Replay Session
//!
//! The transport-independent half of a client connection. A
//! `ReplaySession` owns the connection's subscription registry, answers
//! commands, and turns due records into outbound messages. The socket
//! side (`infrastructure::server::connection`) feeds it commands and
//! wake-ups and writes whatever it queues.
//!
//! # Delivery Order
//!
//! Within a subscription, records go out in recorded order. Across
//! subscriptions, records are merged by the instant they became due; ties
//! go to the lower symbol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use crate::application::ports::HistoryStore;
use crate::domain::market_data::{Payload, Record, SummaryChanges, Symbol};
use crate::domain::protocol::{Command, Level1Kind, Message};
use crate::domain::replay::{Clock, Pacer};
use crate::domain::subscription::{Subscription, SubscriptionMode, SubscriptionRegistry};

// =============================================================================
// Settings
// =============================================================================

/// Per-connection behavior settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Heartbeat intervals.
    pub heartbeat: HeartbeatConfig,
    /// Delay before retrying a watch whose fetch failed.
    pub store_retry_interval: Duration,
    /// Maximum records drained per wake-up.
    pub batch_limit: usize,
    /// Malformed lines tolerated before the connection is closed (0 = never).
    pub max_malformed: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            store_retry_interval: Duration::from_secs(1),
            batch_limit: 1024,
            max_malformed: 10,
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// A message queued for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Status, heartbeat or reply line. Never dropped.
    Status(Message),
    /// Replayed data line. May be dropped under back-pressure.
    Record(Message),
}

impl Outbound {
    /// The wrapped message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        match self {
            Self::Status(m) | Self::Record(m) => m,
        }
    }

    /// Whether the line may be evicted when the client falls behind.
    #[must_use]
    pub const fn is_droppable(&self) -> bool {
        matches!(self, Self::Record(_))
    }
}

/// Why a session is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent `S,DISCONNECT`.
    ClientRequested,
    /// Client closed its write side.
    HalfClosed,
    /// Too many malformed lines.
    TooManyErrors,
    /// Server is shutting down.
    Shutdown,
    /// Socket I/O failed.
    Fault,
}

impl DisconnectReason {
    /// Reason name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequested => "client_requested",
            Self::HalfClosed => "half_closed",
            Self::TooManyErrors => "too_many_errors",
            Self::Shutdown => "shutdown",
            Self::Fault => "fault",
        }
    }
}

/// What the connection should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep going.
    Continue,
    /// Stop reading, flush, and close.
    Disconnect(DisconnectReason),
}

#[derive(Debug, Clone)]
struct PendingWatch {
    mode: SubscriptionMode,
    begin: Option<NaiveDateTime>,
    retry_at: Instant,
}

// =============================================================================
// Session
// =============================================================================

/// Subscription state and replay for one client connection.
pub struct ReplaySession {
    registry: SubscriptionRegistry,
    pending: BTreeMap<Symbol, PendingWatch>,
    pacer: Pacer,
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    heartbeat: Heartbeat,
    malformed: u32,
    backlog: bool,
    outbox: Vec<Outbound>,
}

impl ReplaySession {
    /// Create a session and queue the initial `S,SERVER CONNECTED`.
    #[must_use]
    pub fn new(
        pacer: Pacer,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        let now = clock.now();
        Self {
            registry: SubscriptionRegistry::new(),
            pending: BTreeMap::new(),
            pacer,
            store,
            clock,
            settings,
            heartbeat: Heartbeat::new(settings.heartbeat, now),
            malformed: 0,
            backlog: false,
            outbox: vec![Outbound::Status(Message::ServerConnected)],
        }
    }

    /// The connection's subscriptions.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Symbols waiting for the store to come back.
    pub fn pending_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.pending.keys()
    }

    /// Malformed lines seen so far.
    #[must_use]
    pub const fn malformed_count(&self) -> u32 {
        self.malformed
    }

    /// Take everything queued for the client.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        if !self.outbox.is_empty() {
            self.heartbeat.record_output(self.clock.now());
        }
        std::mem::take(&mut self.outbox)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply a client command.
    pub async fn handle(&mut self, command: Command) -> Directive {
        tracing::debug!(command = command.name(), "Handling command");

        match command {
            Command::Connect => self.status(Message::ServerConnected),
            Command::Disconnect => {
                return Directive::Disconnect(DisconnectReason::ClientRequested);
            }
            Command::SetProtocol(version) => self.status(Message::CurrentProtocol(version)),
            Command::Watch(symbol) => self.watch(symbol, SubscriptionMode::Watch, None).await,
            Command::WatchBars(bars) => {
                let mode = SubscriptionMode::Bars {
                    request_id: bars.request_id,
                    interval_secs: bars.interval_secs,
                };
                self.watch(bars.symbol, mode, bars.begin).await;
            }
            Command::Unwatch(symbol) => self.unwatch(&symbol),
            Command::UnwatchAll => {
                let removed = self.registry.clear() + self.pending.len();
                self.pending.clear();
                tracing::debug!(removed, "Unwatched all symbols");
            }
            Command::Snapshot(symbol) => self.snapshot(symbol).await,
            Command::RequestWatches => {
                let mut symbols = self.registry.watched_symbols();
                symbols.extend(self.pending.keys().cloned());
                symbols.sort();
                self.status(Message::Watches(symbols));
            }
            Command::Timestamps(enabled) => {
                self.heartbeat.set_timestamps(enabled, self.clock.now());
            }
            Command::RequestUpdateFieldnames => self.status(Message::UpdateFieldnames),
            Command::Unsupported(verb) => self.status(Message::Unsupported(verb)),
        }

        Directive::Continue
    }

    /// Report a malformed line.
    ///
    /// Returns `Disconnect` once the malformed-line threshold is reached.
    pub fn reject(&mut self, detail: String) -> Directive {
        self.malformed = self.malformed.saturating_add(1);
        tracing::debug!(malformed = self.malformed, detail = %detail, "Malformed client line");
        self.status(Message::ProtocolError(detail));

        let limit = self.settings.max_malformed;
        if limit > 0 && self.malformed >= limit {
            tracing::warn!(malformed = self.malformed, "Malformed line threshold reached");
            self.status(Message::TooManyErrors);
            return Directive::Disconnect(DisconnectReason::TooManyErrors);
        }

        Directive::Continue
    }

    /// Discard every subscription, returning how many were active.
    pub fn close(&mut self) -> usize {
        let count = self.registry.clear() + self.pending.len();
        self.pending.clear();
        count
    }

    async fn watch(
        &mut self,
        symbol: Symbol,
        mode: SubscriptionMode,
        begin: Option<NaiveDateTime>,
    ) {
        if begin.is_none()
            && let Some(existing) = self.registry.get_mut(&symbol)
            && existing.mode() == &mode
        {
            self.pacer.restart(existing, self.clock.now());
            tracing::debug!(symbol = %symbol, mode = mode.as_str(), "Watch refreshed");
            return;
        }

        self.pending.remove(&symbol);
        self.registry.remove(&symbol);

        match self.store.fetch(&symbol, begin).await {
            Ok(records) if records.is_empty() => {
                tracing::debug!(symbol = %symbol, "No recorded data");
                self.status(Message::NotFound(symbol));
            }
            Ok(records) => {
                tracing::debug!(
                    symbol = %symbol,
                    mode = mode.as_str(),
                    records = records.len(),
                    "Watch started"
                );
                let origin = self.clock.now();
                self.registry
                    .add(Subscription::new(symbol, mode, records, origin));
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %symbol,
                    store = self.store.name(),
                    error = %e,
                    "History store unavailable, will retry"
                );
                let retry_at = self.clock.now() + self.settings.store_retry_interval;
                self.pending.insert(
                    symbol.clone(),
                    PendingWatch {
                        mode,
                        begin,
                        retry_at,
                    },
                );
                self.status(Message::StoreUnavailable(symbol));
            }
        }
    }

    fn unwatch(&mut self, symbol: &Symbol) {
        let watched = self.registry.remove(symbol).is_some();
        let pending = self.pending.remove(symbol).is_some();
        tracing::debug!(symbol = %symbol, removed = watched || pending, "Unwatch");
    }

    async fn snapshot(&mut self, symbol: Symbol) {
        if let Some(existing) = self.registry.get(&symbol) {
            let message = level1(Level1Kind::Summary, existing, SummaryChanges::default());
            self.status(message);
            return;
        }

        let records = match self.store.fetch(&symbol, None).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Snapshot fetch failed");
                self.status(Message::StoreUnavailable(symbol));
                return;
            }
        };

        if records.is_empty() {
            self.status(Message::NotFound(symbol));
            return;
        }

        let now = self.clock.now();
        let mut snapshot = Subscription::new(symbol, SubscriptionMode::Snapshot, records, now);
        let current: Vec<Record> = self.pacer.due(&mut snapshot, now).collect();
        for record in &current {
            snapshot.summary_mut().apply(record);
        }
        let message = level1(Level1Kind::Summary, &snapshot, SummaryChanges::default());
        self.status(message);
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Do all time-driven work due now: retry failed fetches, replay due
    /// records, and emit heartbeats.
    pub async fn tick(&mut self) {
        self.retry_pending().await;
        self.pump();

        let now = self.clock.now();
        for event in self.heartbeat.poll(now) {
            let message = match event {
                HeartbeatEvent::Timestamp => Message::Timestamp(self.clock.wall_time()),
                HeartbeatEvent::Keepalive => Message::ServerConnected,
            };
            self.outbox.push(Outbound::Status(message));
        }
    }

    /// Move due records into the outbox, merged across subscriptions.
    pub fn pump(&mut self) {
        let now = self.clock.now();
        let pacer = self.pacer;
        let mut delivered = 0;
        self.backlog = false;

        loop {
            if delivered >= self.settings.batch_limit {
                self.backlog = true;
                break;
            }

            let mut earliest: Option<(Instant, Symbol)> = None;
            for subscription in self.registry.list_mut() {
                let Some(timestamp) = pacer.due(subscription, now).peek().map(|r| r.timestamp)
                else {
                    continue;
                };
                let due_at = pacer.due_instant(subscription, timestamp);
                if earliest.as_ref().is_none_or(|(best, _)| due_at < *best) {
                    earliest = Some((due_at, subscription.symbol().clone()));
                }
            }

            let Some((_, symbol)) = earliest else {
                break;
            };
            let Some(subscription) = self.registry.get_mut(&symbol) else {
                break;
            };
            let Some(record) = pacer.due(subscription, now).next() else {
                break;
            };

            if let Some(message) = record_message(subscription, &record) {
                self.outbox.push(Outbound::Record(message));
            }
            delivered += 1;
        }

        for subscription in self.registry.list_mut() {
            if subscription.take_end_of_data() {
                tracing::debug!(
                    symbol = %subscription.symbol(),
                    delivered = subscription.delivered(),
                    "End of recorded data"
                );
                self.outbox
                    .push(Outbound::Status(Message::EndOfData(subscription.symbol().clone())));
            }
        }
    }

    /// When the session next needs a `tick`.
    #[must_use]
    pub fn next_wake(&self) -> Option<Instant> {
        if self.backlog {
            return Some(self.clock.now());
        }

        self.registry
            .list()
            .filter_map(|s| self.pacer.next_due_at(s))
            .chain(self.pending.values().map(|p| p.retry_at))
            .chain(self.heartbeat.next_deadline())
            .min()
    }

    async fn retry_pending(&mut self) {
        let now = self.clock.now();
        let ready: Vec<Symbol> = self
            .pending
            .iter()
            .filter(|(_, p)| p.retry_at <= now)
            .map(|(s, _)| s.clone())
            .collect();

        for symbol in ready {
            if let Some(pending) = self.pending.remove(&symbol) {
                tracing::debug!(symbol = %symbol, "Retrying watch");
                self.watch(symbol, pending.mode, pending.begin).await;
            }
        }
    }

    fn status(&mut self, message: Message) {
        self.outbox.push(Outbound::Status(message));
    }
}

impl std::fmt::Debug for ReplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySession")
            .field("subscriptions", &self.registry.len())
            .field("pending", &self.pending.len())
            .field("store", &self.store.name())
            .field("malformed", &self.malformed)
            .finish_non_exhaustive()
    }
}

/// Fold a record into its subscription and build the line to send, if any.
///
/// Bar watches only send bar records; other records still update the
/// summary.
fn record_message(subscription: &mut Subscription, record: &Record) -> Option<Message> {
    let changes = subscription.summary_mut().apply(record);

    match (subscription.mode(), &record.payload) {
        (SubscriptionMode::Bars { request_id, .. }, Payload::Bar(bar)) => Some(Message::Bar {
            request_id: request_id.clone(),
            symbol: subscription.symbol().clone(),
            timestamp: record.timestamp,
            bar: *bar,
        }),
        (SubscriptionMode::Bars { .. }, _) => None,
        _ => Some(level1(Level1Kind::Update, subscription, changes)),
    }
}

fn level1(kind: Level1Kind, subscription: &Subscription, changes: SummaryChanges) -> Message {
    Message::Level1 {
        kind,
        symbol: subscription.symbol().clone(),
        summary: Box::new(subscription.summary().clone()),
        changes,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use mockall::Sequence;
    use rust_decimal::Decimal;

    use crate::application::ports::{MockHistoryStore, StoreError};
    use crate::domain::market_data::Bar;
    use crate::domain::protocol::BarWatch;
    use crate::domain::replay::{EndOfDataPolicy, ManualClock};
    use crate::infrastructure::store::InMemoryStore;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 11, 29)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn symbol(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn trades(offsets_secs: &[i64]) -> Vec<Record> {
        offsets_secs
            .iter()
            .map(|s| {
                Record::trade(
                    base() + TimeDelta::seconds(*s),
                    Decimal::new(26_700 + s, 2),
                    100,
                )
            })
            .collect()
    }

    fn session_with(
        store: Arc<dyn HistoryStore>,
        speed: f64,
        on_end: EndOfDataPolicy,
        settings: SessionSettings,
    ) -> (ReplaySession, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(base()));
        let pacer = Pacer::new(speed, on_end).unwrap();
        let session = ReplaySession::new(pacer, store, clock.clone(), settings);
        (session, clock)
    }

    fn aapl_session(speed: f64, on_end: EndOfDataPolicy) -> (ReplaySession, Arc<ManualClock>) {
        let store = InMemoryStore::builder()
            .with_records(symbol("AAPL"), trades(&[0, 5, 10]))
            .with_records(symbol("IBM"), trades(&[0, 5]))
            .build();
        session_with(Arc::new(store), speed, on_end, SessionSettings::default())
    }

    fn last_prices(outbox: &[Outbound]) -> Vec<(String, Decimal)> {
        outbox
            .iter()
            .filter_map(|o| match o {
                Outbound::Record(Message::Level1 {
                    symbol, summary, ..
                }) => Some((symbol.to_string(), summary.last?)),
                _ => None,
            })
            .collect()
    }

    fn statuses(outbox: &[Outbound]) -> Vec<Message> {
        outbox
            .iter()
            .filter_map(|o| match o {
                Outbound::Status(m) => Some(m.clone()),
                Outbound::Record(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn greets_on_creation() {
        let (mut session, _clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        assert_eq!(
            session.take_outbox(),
            vec![Outbound::Status(Message::ServerConnected)]
        );
        assert!(session.take_outbox().is_empty());
    }

    #[tokio::test]
    async fn watch_replays_at_speed() {
        let (mut session, clock) = aapl_session(10.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        session.tick().await;
        assert_eq!(last_prices(&session.take_outbox()).len(), 1);

        clock.advance(Duration::from_millis(600));
        session.tick().await;
        let second = last_prices(&session.take_outbox());
        assert_eq!(second, vec![("AAPL".to_string(), Decimal::new(26_705, 2))]);

        clock.advance(Duration::from_millis(500));
        session.tick().await;
        let third = session.take_outbox();
        assert_eq!(last_prices(&third).len(), 1);
        assert!(statuses(&third).contains(&Message::EndOfData(symbol("AAPL"))));

        clock.advance(Duration::from_secs(10));
        session.tick().await;
        assert!(last_prices(&session.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn watch_of_unknown_symbol_reports_not_found_once() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("MSFT"))).await;
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::NotFound(symbol("MSFT"))]
        );
        assert!(session.registry().is_empty());

        clock.advance(Duration::from_secs(60));
        session.tick().await;
        let later = session.take_outbox();
        assert!(
            later
                .iter()
                .all(|o| matches!(o, Outbound::Status(Message::ServerConnected)))
        );
    }

    #[tokio::test]
    async fn merges_symbols_in_time_order() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("IBM"))).await;
        session.handle(Command::Watch(symbol("AAPL"))).await;
        clock.advance(Duration::from_secs(6));
        session.tick().await;

        let names: Vec<_> = last_prices(&session.take_outbox())
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(names, ["AAPL", "IBM", "AAPL", "IBM"]);
    }

    #[tokio::test]
    async fn rewatch_does_not_redeliver() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        clock.advance(Duration::from_secs(6));
        session.tick().await;
        assert_eq!(last_prices(&session.take_outbox()).len(), 2);

        session.handle(Command::Watch(symbol("AAPL"))).await;
        session.tick().await;
        assert!(last_prices(&session.take_outbox()).is_empty());

        clock.advance(Duration::from_secs(4));
        session.tick().await;
        let after = last_prices(&session.take_outbox());
        assert_eq!(after, vec![("AAPL".to_string(), Decimal::new(26_710, 2))]);
    }

    #[tokio::test]
    async fn unwatch_stops_output() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Loop);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        session.tick().await;
        session.take_outbox();

        session.handle(Command::Unwatch(symbol("AAPL"))).await;
        session.handle(Command::Unwatch(symbol("AAPL"))).await;
        clock.advance(Duration::from_secs(30));
        session.tick().await;

        assert!(last_prices(&session.take_outbox()).is_empty());
        assert!(session.next_wake().is_some_and(|at| at > clock.now()));
    }

    #[tokio::test]
    async fn loop_policy_keeps_delivering() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Loop);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        // One lap is 10s of data plus 5s spacing.
        clock.advance(Duration::from_secs(20));
        session.tick().await;

        let out = session.take_outbox();
        assert_eq!(last_prices(&out).len(), 5);
        assert!(!statuses(&out).contains(&Message::EndOfData(symbol("AAPL"))));
    }

    #[tokio::test]
    async fn snapshot_of_unwatched_symbol_sends_summary() {
        let (mut session, _clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Snapshot(symbol("AAPL"))).await;
        let out = session.take_outbox();

        assert!(session.registry().is_empty());
        match out.as_slice() {
            [Outbound::Status(Message::Level1 { kind, summary, .. })] => {
                assert_eq!(*kind, Level1Kind::Summary);
                assert_eq!(summary.last, Some(Decimal::new(26_700, 2)));
            }
            other => panic!("unexpected outbox: {other:?}"),
        }

        session.handle(Command::Snapshot(symbol("MSFT"))).await;
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::NotFound(symbol("MSFT"))]
        );
    }

    #[tokio::test]
    async fn snapshot_of_watched_symbol_uses_live_state() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        clock.advance(Duration::from_secs(5));
        session.tick().await;
        session.take_outbox();

        session.handle(Command::Snapshot(symbol("AAPL"))).await;
        match session.take_outbox().as_slice() {
            [Outbound::Status(Message::Level1 { summary, .. })] => {
                assert_eq!(summary.last, Some(Decimal::new(26_705, 2)));
                assert_eq!(summary.total_volume, 200);
            }
            other => panic!("unexpected outbox: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bar_watch_sends_only_bars() {
        let bar = Bar {
            open: Decimal::new(26_760, 2),
            high: Decimal::new(26_800, 2),
            low: Decimal::new(26_755, 2),
            close: Decimal::new(26_790, 2),
            total_volume: 1_000,
            period_volume: 100,
            num_trades: 12,
        };
        let mut records = trades(&[0]);
        records.push(Record::bar(base() + TimeDelta::seconds(60), bar));
        let store = InMemoryStore::builder()
            .with_records(symbol("AAPL"), records)
            .build();
        let (mut session, clock) = session_with(
            Arc::new(store),
            60.0,
            EndOfDataPolicy::Hold,
            SessionSettings::default(),
        );
        session.take_outbox();

        session
            .handle(Command::WatchBars(BarWatch {
                symbol: symbol("AAPL"),
                interval_secs: 60,
                begin: None,
                request_id: "req1".to_string(),
            }))
            .await;
        clock.advance(Duration::from_secs(1));
        session.tick().await;

        let bars: Vec<_> = session
            .take_outbox()
            .into_iter()
            .filter(Outbound::is_droppable)
            .collect();
        match bars.as_slice() {
            [Outbound::Record(Message::Bar { request_id, bar: b, .. })] => {
                assert_eq!(request_id, "req1");
                assert_eq!(b.close, Decimal::new(26_790, 2));
            }
            other => panic!("unexpected outbox: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_lines_close_at_threshold() {
        let settings = SessionSettings {
            max_malformed: 3,
            ..SessionSettings::default()
        };
        let store = InMemoryStore::builder().build();
        let (mut session, _clock) =
            session_with(Arc::new(store), 1.0, EndOfDataPolicy::Hold, settings);
        session.take_outbox();

        assert_eq!(session.reject("bad 1".into()), Directive::Continue);
        assert_eq!(session.reject("bad 2".into()), Directive::Continue);
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![
                Message::ProtocolError("bad 1".into()),
                Message::ProtocolError("bad 2".into())
            ]
        );

        assert_eq!(
            session.reject("bad 3".into()),
            Directive::Disconnect(DisconnectReason::TooManyErrors)
        );
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::ProtocolError("bad 3".into()), Message::TooManyErrors]
        );
        assert_eq!(session.malformed_count(), 3);
    }

    #[tokio::test]
    async fn zero_threshold_never_closes() {
        let settings = SessionSettings {
            max_malformed: 0,
            ..SessionSettings::default()
        };
        let store = InMemoryStore::builder().build();
        let (mut session, _clock) =
            session_with(Arc::new(store), 1.0, EndOfDataPolicy::Hold, settings);

        for i in 0..100 {
            assert_eq!(session.reject(format!("bad {i}")), Directive::Continue);
        }
    }

    #[tokio::test]
    async fn store_outage_is_retried() {
        let mut store = MockHistoryStore::new();
        let mut seq = Sequence::new();
        store.expect_name().return_const("mock");
        store
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StoreError::Unavailable("connection refused".into())));
        store
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(trades(&[0, 1]).into()));

        let (mut session, clock) = session_with(
            Arc::new(store),
            1.0,
            EndOfDataPolicy::Hold,
            SessionSettings::default(),
        );
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::StoreUnavailable(symbol("AAPL"))]
        );
        assert_eq!(session.pending_symbols().count(), 1);

        clock.advance(Duration::from_secs(1));
        session.tick().await;
        assert_eq!(last_prices(&session.take_outbox()).len(), 1);
        assert_eq!(session.pending_symbols().count(), 0);
        assert!(session.registry().contains(&symbol("AAPL")));
    }

    #[tokio::test]
    async fn batch_limit_leaves_backlog() {
        let settings = SessionSettings {
            batch_limit: 2,
            ..SessionSettings::default()
        };
        let store = InMemoryStore::builder()
            .with_records(symbol("AAPL"), trades(&[0, 0, 0, 0, 0]))
            .build();
        let (mut session, clock) =
            session_with(Arc::new(store), 1.0, EndOfDataPolicy::Hold, settings);
        session.take_outbox();

        session.handle(Command::Watch(symbol("AAPL"))).await;
        session.tick().await;
        assert_eq!(last_prices(&session.take_outbox()).len(), 2);
        assert_eq!(session.next_wake(), Some(clock.now()));

        session.tick().await;
        session.tick().await;
        assert_eq!(last_prices(&session.take_outbox()).len(), 3);
    }

    #[tokio::test]
    async fn housekeeping_commands() {
        let (mut session, _clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Watch(symbol("IBM"))).await;
        session.handle(Command::Watch(symbol("AAPL"))).await;
        session.handle(Command::RequestWatches).await;
        session.handle(Command::SetProtocol("6.1".into())).await;
        session
            .handle(Command::Unsupported("SELECT UPDATE FIELDS".into()))
            .await;

        assert_eq!(
            statuses(&session.take_outbox()),
            vec![
                Message::Watches(vec![symbol("AAPL"), symbol("IBM")]),
                Message::CurrentProtocol("6.1".into()),
                Message::Unsupported("SELECT UPDATE FIELDS".into()),
            ]
        );

        session.handle(Command::UnwatchAll).await;
        assert!(session.registry().is_empty());
        assert_eq!(
            session.handle(Command::Disconnect).await,
            Directive::Disconnect(DisconnectReason::ClientRequested)
        );
    }

    #[tokio::test]
    async fn timestamps_emit_wall_time() {
        let (mut session, clock) = aapl_session(1.0, EndOfDataPolicy::Hold);
        session.take_outbox();

        session.handle(Command::Timestamps(true)).await;
        session.tick().await;
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::Timestamp(base())]
        );

        clock.advance(Duration::from_secs(1));
        session.tick().await;
        assert_eq!(
            statuses(&session.take_outbox()),
            vec![Message::Timestamp(base() + TimeDelta::seconds(1))]
        );
    }
}
