//! Replay Pacing Integration Tests
//!
//! Runs single connections over in-memory pipes with a manual clock, so
//! replay time only moves when a test advances it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use iqfeed_replay_server::infrastructure::server::SessionError;
use iqfeed_replay_server::{
    Connection, ConnectionContext, ConnectionSettings, DisconnectReason, EndOfDataPolicy,
    InMemoryStore, ManualClock, Pacer, Record, SessionSettings, SessionSummary, Symbol,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2019, 11, 29)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

fn aapl_trades(offsets_secs: impl IntoIterator<Item = i64>) -> InMemoryStore {
    let records = offsets_secs.into_iter().map(|s| {
        Record::trade(
            base() + TimeDelta::seconds(s),
            Decimal::new(26_700 + s, 2),
            100,
        )
    });
    InMemoryStore::builder()
        .with_records(Symbol::parse("AAPL").unwrap(), records)
        .build()
}

struct Harness {
    clock: Arc<ManualClock>,
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<Result<SessionSummary, SessionError>>,
}

impl Harness {
    fn start(
        store: InMemoryStore,
        on_end: EndOfDataPolicy,
        settings: ConnectionSettings,
        pipe_capacity: usize,
    ) -> Self {
        let clock = Arc::new(ManualClock::starting_at(base()));
        let context = ConnectionContext {
            pacer: Pacer::new(1.0, on_end).unwrap(),
            store: Arc::new(store),
            clock: clock.clone(),
            settings: ConnectionSettings {
                poll_interval: Duration::from_millis(5),
                ..settings
            },
        };

        let (client, server) = tokio::io::duplex(pipe_capacity);
        let task = tokio::spawn(
            Connection::new(None, Arc::new(context)).run(server, CancellationToken::new()),
        );
        let (read, writer) = tokio::io::split(client);

        Self {
            clock,
            reader: BufReader::new(read),
            writer,
            task,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        (read > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Skip keepalives, which a large clock jump can trigger.
    async fn next_data_line(&mut self) -> String {
        loop {
            let line = self.next_line().await.expect("unexpected EOF");
            if line != "S,SERVER CONNECTED" {
                return line;
            }
        }
    }

    async fn finish(mut self) -> (Vec<String>, SessionSummary) {
        let mut rest = Vec::new();
        while let Some(line) = self.next_line().await {
            rest.push(line);
        }
        let summary = self.task.await.unwrap().unwrap();
        (rest, summary)
    }
}

fn last_price(line: &str) -> &str {
    assert!(line.starts_with("Q,AAPL,"), "not an AAPL update: {line}");
    line.split(',').nth(2).unwrap()
}

#[tokio::test]
async fn test_hold_stops_after_end_of_data() {
    let mut harness = Harness::start(
        aapl_trades([0, 10]),
        EndOfDataPolicy::Hold,
        ConnectionSettings::default(),
        4096,
    );
    assert_eq!(harness.next_line().await.unwrap(), "S,SERVER CONNECTED");

    harness.send("wAAPL").await;
    assert_eq!(last_price(&harness.next_data_line().await), "267.00");

    harness.clock.advance(Duration::from_secs(15));
    assert_eq!(last_price(&harness.next_data_line().await), "267.10");
    assert_eq!(harness.next_data_line().await, "S,END OF DATA,AAPL");

    harness.clock.advance(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.send("S,DISCONNECT").await;

    let (rest, summary) = harness.finish().await;
    assert!(rest.iter().all(|line| !line.starts_with("Q,")), "{rest:?}");
    assert_eq!(summary.reason, DisconnectReason::ClientRequested);
    assert_eq!(summary.subscriptions_closed, 1);
}

#[tokio::test]
async fn test_loop_wraps_without_end_of_data() {
    let mut harness = Harness::start(
        aapl_trades([0, 10]),
        EndOfDataPolicy::Loop,
        ConnectionSettings::default(),
        4096,
    );
    harness.next_line().await.unwrap();

    harness.send("wAAPL").await;
    assert_eq!(last_price(&harness.next_data_line().await), "267.00");

    // One lap is the 10s span plus the 10s average spacing.
    harness.clock.advance(Duration::from_secs(25));
    assert_eq!(last_price(&harness.next_data_line().await), "267.10");
    assert_eq!(last_price(&harness.next_data_line().await), "267.00");

    harness.send("S,DISCONNECT").await;
    let (rest, _) = harness.finish().await;
    assert!(!rest.contains(&"S,END OF DATA,AAPL".to_string()));
}

#[tokio::test]
async fn test_slow_reader_gets_gap_notice() {
    let settings = ConnectionSettings {
        queue_capacity: 4,
        ..ConnectionSettings::default()
    };
    let mut harness = Harness::start(
        aapl_trades(0..50),
        EndOfDataPolicy::Hold,
        settings,
        64,
    );
    harness.next_line().await.unwrap();
    harness.send("wAAPL").await;

    // Stop reading while the whole series comes due.
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.clock.advance(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut lines = Vec::new();
    loop {
        let line = harness.next_data_line().await;
        if line == "S,END OF DATA,AAPL" {
            break;
        }
        lines.push(line);
    }

    let gaps: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("S,GAP,"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(gaps.len(), 1, "{lines:?}");
    let dropped: u64 = lines[gaps[0]]["S,GAP,".len()..].parse().unwrap();
    assert!(dropped > 0);

    // Everything after the gap is the newest slice of the series, in order.
    let after: Vec<&str> = lines[gaps[0] + 1..]
        .iter()
        .filter(|l| l.starts_with("Q,"))
        .map(|l| last_price(l))
        .collect();
    assert!(!after.is_empty());
    let first_kept = 50 - after.len();
    let expected: Vec<String> = (first_kept..50).map(|s| format!("267.{s:02}")).collect();
    assert_eq!(after, expected);

    let delivered = lines.iter().filter(|l| l.starts_with("Q,")).count();
    assert!(delivered < 50);

    harness.send("S,DISCONNECT").await;
    let (_, summary) = harness.finish().await;
    assert!(summary.records_dropped > 0);
}

#[tokio::test]
async fn test_malformed_input_closes_connection() {
    let settings = ConnectionSettings {
        session: SessionSettings {
            max_malformed: 2,
            ..SessionSettings::default()
        },
        ..ConnectionSettings::default()
    };
    let mut harness = Harness::start(
        aapl_trades([0]),
        EndOfDataPolicy::Hold,
        settings,
        4096,
    );
    harness.next_line().await.unwrap();

    harness.send("garbage").await;
    harness.send("S,WATCH").await;

    let (rest, summary) = harness.finish().await;
    assert_eq!(rest.len(), 3, "{rest:?}");
    assert!(rest[0].starts_with("E,!SYNTAX_ERROR!,"));
    assert!(rest[1].starts_with("E,!SYNTAX_ERROR!,"));
    assert_eq!(rest[2], "E,!TOO MANY ERRORS!");
    assert_eq!(summary.reason, DisconnectReason::TooManyErrors);
}

#[tokio::test]
async fn test_timestamps_follow_the_clock() {
    let mut harness = Harness::start(
        aapl_trades([0]),
        EndOfDataPolicy::Hold,
        ConnectionSettings::default(),
        4096,
    );
    harness.next_line().await.unwrap();

    harness.send("S,TIMESTAMPSON").await;
    assert_eq!(harness.next_data_line().await, "T,20191129 09:30:00");

    harness.clock.advance(Duration::from_secs(1));
    assert_eq!(harness.next_data_line().await, "T,20191129 09:30:01");

    harness.send("S,TIMESTAMPSOFF").await;
    harness.send("S,DISCONNECT").await;
    let (rest, _) = harness.finish().await;
    assert!(rest.iter().all(|line| !line.starts_with("T,")), "{rest:?}");
}
