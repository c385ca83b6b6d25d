//! Feed Server Integration Tests
//!
//! Drives the TCP server end to end with plain socket clients.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use iqfeed_replay_server::{
    ConnectionContext, ConnectionSettings, EndOfDataPolicy, InMemoryStore, Pacer, Record,
    ReplayServer, ServerError, ServerStats, Symbol, SystemClock,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
}

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2019, 11, 29)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

/// AAPL trades one second apart, replayed at 100x.
async fn start_server(max_connections: usize) -> TestServer {
    let records = (0..3).map(|s| {
        Record::trade(
            base() + TimeDelta::seconds(s),
            Decimal::new(26_700 + s, 2),
            100,
        )
    });
    let store = InMemoryStore::builder()
        .with_records(Symbol::parse("AAPL").unwrap(), records)
        .build();

    let context = ConnectionContext {
        pacer: Pacer::new(100.0, EndOfDataPolicy::Hold).unwrap(),
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
        settings: ConnectionSettings {
            poll_interval: Duration::from_millis(5),
            ..ConnectionSettings::default()
        },
    };

    let cancel = CancellationToken::new();
    let server = ReplayServer::new(context, max_connections, cancel.clone());
    let stats = server.stats();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move { server.serve_listener(listener).await });

    TestServer {
        addr,
        stats,
        cancel,
        handle,
    }
}

struct FeedClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FeedClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line without its terminator, or `None` at EOF.
    async fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap_or(0);
        (read > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Skip keepalives.
    async fn next_data_line(&mut self) -> Option<String> {
        loop {
            match self.next_line().await {
                Some(line) if line == "S,SERVER CONNECTED" => {}
                other => return other,
            }
        }
    }

    async fn read_to_eof(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        lines
    }
}

async fn wait_for_active(stats: &ServerStats, expected: usize) {
    timeout(READ_TIMEOUT, async {
        while stats.active() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active connection count never settled");
}

#[tokio::test]
async fn test_watch_streams_updates_then_end_of_data() {
    let server = start_server(0).await;
    let mut client = FeedClient::connect(server.addr).await;

    assert_eq!(client.next_line().await.unwrap(), "S,SERVER CONNECTED");
    client.send("wAAPL").await;

    let mut prices = Vec::new();
    loop {
        let line = client.next_data_line().await.unwrap();
        if line == "S,END OF DATA,AAPL" {
            break;
        }
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[0], "Q");
        assert_eq!(fields[1], "AAPL");
        prices.push(fields[2].to_string());
    }

    assert_eq!(prices, vec!["267.00", "267.01", "267.02"]);
    server.cancel.cancel();
}

#[tokio::test]
async fn test_unknown_symbol_reports_not_found() {
    let server = start_server(0).await;
    let mut client = FeedClient::connect(server.addr).await;

    client.next_line().await.unwrap();
    client.send("wMSFT").await;

    assert_eq!(client.next_data_line().await.unwrap(), "n,MSFT");
    server.cancel.cancel();
}

#[tokio::test]
async fn test_clients_are_independent() {
    let server = start_server(0).await;
    let mut first = FeedClient::connect(server.addr).await;
    let mut second = FeedClient::connect(server.addr).await;
    first.next_line().await.unwrap();
    second.next_line().await.unwrap();

    first.send("wAAPL").await;
    assert!(first.next_data_line().await.unwrap().starts_with("Q,AAPL,"));

    second.send("S,REQUEST WATCHES").await;
    assert_eq!(second.next_data_line().await.unwrap(), "S,WATCHES");

    wait_for_active(&server.stats, 2).await;
    server.cancel.cancel();
}

#[tokio::test]
async fn test_connection_limit_rejects_with_server_busy() {
    let server = start_server(1).await;

    let mut admitted = FeedClient::connect(server.addr).await;
    assert_eq!(admitted.next_line().await.unwrap(), "S,SERVER CONNECTED");

    let mut rejected = FeedClient::connect(server.addr).await;
    assert_eq!(rejected.read_to_eof().await, vec!["S,SERVER BUSY"]);

    assert_eq!(server.stats.rejected(), 1);
    assert_eq!(server.stats.active(), 1);
    server.cancel.cancel();
}

#[tokio::test]
async fn test_disconnect_releases_connection_slot() {
    let server = start_server(1).await;

    let mut first = FeedClient::connect(server.addr).await;
    first.next_line().await.unwrap();
    first.send("S,DISCONNECT").await;
    assert!(first.read_to_eof().await.is_empty());

    wait_for_active(&server.stats, 0).await;

    let mut second = FeedClient::connect(server.addr).await;
    assert_eq!(second.next_line().await.unwrap(), "S,SERVER CONNECTED");
    assert_eq!(server.stats.accepted(), 2);
    server.cancel.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = start_server(0).await;
    let mut client = FeedClient::connect(server.addr).await;
    client.next_line().await.unwrap();
    assert!(server.stats.is_listening());

    server.cancel.cancel();

    client.read_to_eof().await;
    timeout(READ_TIMEOUT, server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!server.stats.is_listening());
    assert_eq!(server.stats.active(), 0);
}
