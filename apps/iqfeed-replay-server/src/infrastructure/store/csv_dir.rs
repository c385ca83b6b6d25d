//! CSV directory history store.
//!
//! Each symbol's records live in `<data_dir>/<SYMBOL>.csv` with a header
//! row. Columns a row's kind does not use may be empty or absent:
//!
//! ```text
//! timestamp,kind,price,size,market_center,conditions,bid,bid_size,ask,ask_size,open,high,low,close,total_volume,period_volume,num_trades
//! 2019-11-29 09:30:00.125,trade,267.01,100,11,,,,,,,,,,,,
//! 2019-11-29 09:30:00.250,quote,,,,,267.00,300,267.02,200,,,,,,,
//! 2019-11-29 09:31:00,bar,,,,,,,,,267.60,268.00,267.55,267.90,1000,100,12
//! ```
//!
//! Files are read on a blocking thread for every fetch, so edits to the
//! data directory are picked up by the next watch.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, Trim};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::records_from;
use crate::application::ports::{HistoryStore, RecordSeries, StoreError};
use crate::domain::market_data::{
    Bar, Payload, Quote, Record, RecordKind, Symbol, Trade, sort_records,
};
use crate::infrastructure::metrics;

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y%m%d %H%M%S"];

/// History store reading one CSV file per symbol.
#[derive(Debug, Clone)]
pub struct CsvDirectoryStore {
    data_dir: PathBuf,
}

impl CsvDirectoryStore {
    /// Create a store over `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// The data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File holding `symbol`'s records, if the symbol maps to a plain file name.
    fn path_for(&self, symbol: &Symbol) -> Option<PathBuf> {
        let name = symbol.as_str();
        if name.starts_with('.') || name.contains(['/', '\\']) {
            return None;
        }
        Some(self.data_dir.join(format!("{name}.csv")))
    }
}

#[async_trait]
impl HistoryStore for CsvDirectoryStore {
    async fn fetch(
        &self,
        symbol: &Symbol,
        from: Option<NaiveDateTime>,
    ) -> Result<RecordSeries, StoreError> {
        let Some(path) = self.path_for(symbol) else {
            return Ok(RecordSeries::from(Vec::new()));
        };

        let started = Instant::now();
        let owned = symbol.clone();
        let result = tokio::task::spawn_blocking(move || load_series(&path, &owned))
            .await
            .map_err(|e| StoreError::Unavailable(format!("reader task failed: {e}")))
            .and_then(|loaded| loaded);

        metrics::record_store_fetch(self.name(), started.elapsed(), result.is_ok());

        match &result {
            Ok(series) => tracing::debug!(symbol = %symbol, records = series.len(), "Loaded CSV series"),
            Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Failed to load CSV series"),
        }

        result.map(|series| records_from(&series, from))
    }

    fn name(&self) -> &'static str {
        "csv"
    }
}

/// Read and sort one symbol's file. A missing file is an empty series.
fn load_series(path: &Path, symbol: &Symbol) -> Result<RecordSeries, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RecordSeries::from(Vec::new())),
        Err(e) => return Err(StoreError::Io(e)),
    };

    let corrupt = |message: String| StoreError::Corrupt {
        symbol: symbol.to_string(),
        message,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(file);

    let mut records = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|e| match e.kind() {
            csv::ErrorKind::Io(_) => StoreError::Unavailable(e.to_string()),
            _ => corrupt(e.to_string()),
        })?;
        let stamp = row.timestamp.clone();
        let record = row
            .into_record()
            .map_err(|reason| corrupt(format!("row at {stamp:?}: {reason}")))?;
        records.push(record);
    }

    sort_records(&mut records);
    Ok(records.into())
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    kind: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    market_center: Option<u16>,
    #[serde(default)]
    conditions: Option<String>,
    #[serde(default)]
    bid: Option<String>,
    #[serde(default)]
    bid_size: Option<u64>,
    #[serde(default)]
    ask: Option<String>,
    #[serde(default)]
    ask_size: Option<u64>,
    #[serde(default)]
    open: Option<String>,
    #[serde(default)]
    high: Option<String>,
    #[serde(default)]
    low: Option<String>,
    #[serde(default)]
    close: Option<String>,
    #[serde(default)]
    total_volume: Option<u64>,
    #[serde(default)]
    period_volume: Option<u64>,
    #[serde(default)]
    num_trades: Option<u64>,
}

impl CsvRow {
    fn into_record(self) -> Result<Record, String> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let kind = RecordKind::parse(&self.kind)
            .ok_or_else(|| format!("unknown record kind {:?}", self.kind))?;

        let payload = match kind {
            RecordKind::Trade => Payload::Trade(Trade {
                price: decimal("price", self.price.as_deref())?,
                size: required("size", self.size)?,
                market_center: self.market_center,
                conditions: self.conditions.filter(|c| !c.is_empty()),
            }),
            RecordKind::Quote => Payload::Quote(Quote {
                bid: decimal("bid", self.bid.as_deref())?,
                bid_size: required("bid_size", self.bid_size)?,
                ask: decimal("ask", self.ask.as_deref())?,
                ask_size: required("ask_size", self.ask_size)?,
            }),
            RecordKind::Bar => Payload::Bar(Bar {
                open: decimal("open", self.open.as_deref())?,
                high: decimal("high", self.high.as_deref())?,
                low: decimal("low", self.low.as_deref())?,
                close: decimal("close", self.close.as_deref())?,
                total_volume: required("total_volume", self.total_volume)?,
                period_volume: required("period_volume", self.period_volume)?,
                num_trades: self.num_trades.unwrap_or(0),
            }),
        };

        Ok(Record { timestamp, payload })
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .ok_or_else(|| format!("invalid timestamp {raw:?}"))
}

fn decimal(column: &str, raw: Option<&str>) -> Result<Decimal, String> {
    let raw = raw.filter(|v| !v.is_empty()).ok_or_else(|| format!("missing {column}"))?;
    Decimal::from_str(raw).map_err(|e| format!("invalid {column} {raw:?}: {e}"))
}

fn required<T>(column: &str, value: Option<T>) -> Result<T, String> {
    value.ok_or_else(|| format!("missing {column}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    const HEADER: &str = "timestamp,kind,price,size,market_center,conditions,bid,bid_size,ask,ask_size,open,high,low,close,total_volume,period_volume,num_trades";

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn at(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 11, 29)
            .unwrap()
            .and_hms_milli_opt(h, m, s, ms)
            .unwrap()
    }

    fn write_symbol(dir: &Path, symbol: &str, rows: &[&str]) {
        let mut body = String::from(HEADER);
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        body.push('\n');
        fs::write(dir.join(format!("{symbol}.csv")), body).unwrap();
    }

    #[tokio::test]
    async fn loads_and_sorts_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write_symbol(
            dir.path(),
            "AAPL",
            &[
                "2019-11-29 09:31:00,bar,,,,,,,,,267.60,268.00,267.55,267.90,1000,100,12",
                "2019-11-29 09:30:00.250,quote,,,,,267.00,300,267.02,200,,,,,,,",
                "2019-11-29 09:30:00.250,trade,267.01,100,11,F,,,,,,,,,,,",
            ],
        );

        let store = CsvDirectoryStore::new(dir.path());
        let records = store.fetch(&sym("aapl"), None).await.unwrap();

        assert_eq!(records.len(), 3);
        assert!(matches!(records[0].payload, Payload::Quote(_)));
        match &records[1].payload {
            Payload::Trade(trade) => {
                assert_eq!(trade.price.to_string(), "267.01");
                assert_eq!(trade.market_center, Some(11));
                assert_eq!(trade.conditions.as_deref(), Some("F"));
            }
            other => panic!("expected trade, got {other:?}"),
        }
        assert_eq!(records[2].timestamp, at(9, 31, 0, 0));
        assert_eq!(records[2].kind(), RecordKind::Bar);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirectoryStore::new(dir.path());
        assert!(store.fetch(&sym("MSFT"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_like_symbols_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirectoryStore::new(dir.path());
        assert!(store.fetch(&sym("../SECRET"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn from_skips_earlier_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_symbol(
            dir.path(),
            "IBM",
            &[
                "2019-11-29 09:30:00,t,134.00,10,,,,,,,,,,,,,",
                "2019-11-29 09:30:05,t,134.05,10,,,,,,,,,,,,,",
            ],
        );

        let store = CsvDirectoryStore::new(dir.path());
        let records = store
            .fetch(&sym("IBM"), Some(at(9, 30, 1, 0)))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, at(9, 30, 5, 0));
    }

    #[tokio::test]
    async fn bad_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_symbol(dir.path(), "BAD", &["2019-11-29 09:30:00,trade,abc,10,,,,,,,,,,,,,"]);

        let store = CsvDirectoryStore::new(dir.path());
        let err = store.fetch(&sym("BAD"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn unknown_kind_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_symbol(dir.path(), "ODD", &["2019-11-29 09:30:00,news,,,,,,,,,,,,,,,"]);

        let store = CsvDirectoryStore::new(dir.path());
        assert!(store.fetch(&sym("ODD"), None).await.is_err());
    }

    #[test]
    fn accepts_compact_timestamps() {
        assert_eq!(
            parse_timestamp("20191129 093000").unwrap(),
            at(9, 30, 0, 0)
        );
        assert_eq!(
            parse_timestamp("2019-11-29T09:30:00.5").unwrap(),
            at(9, 30, 0, 500)
        );
        assert!(parse_timestamp("yesterday").is_err());
    }
}
