//! History Store Adapters
//!
//! Implementations of the [`HistoryStore`] port.
//!
//! - `InMemoryStore`: fixed record sets, for tests and embedding
//! - `CsvDirectoryStore`: one `<SYMBOL>.csv` file per symbol
//!
//! [`HistoryStore`]: crate::application::ports::HistoryStore

mod csv_dir;
mod memory;

pub use csv_dir::CsvDirectoryStore;
pub use memory::{InMemoryStore, InMemoryStoreBuilder};

use chrono::NaiveDateTime;

use crate::application::ports::RecordSeries;
use crate::domain::market_data::Record;

/// Records at or after `from`, sharing the series when nothing is cut.
fn records_from(series: &RecordSeries, from: Option<NaiveDateTime>) -> RecordSeries {
    let Some(from) = from else {
        return series.clone();
    };

    match series.partition_point(|r| r.timestamp < from) {
        0 => series.clone(),
        start => series[start..].iter().cloned().collect::<Vec<Record>>().into(),
    }
}
