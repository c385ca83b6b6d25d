//! In-memory history store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::records_from;
use crate::application::ports::{HistoryStore, RecordSeries, StoreError};
use crate::domain::market_data::{Record, Symbol, sort_records};

/// Immutable map of symbol to sorted records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    series: HashMap<Symbol, RecordSeries>,
}

impl InMemoryStore {
    /// Start building a store.
    #[must_use]
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Number of symbols with data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the store holds no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn fetch(
        &self,
        symbol: &Symbol,
        from: Option<NaiveDateTime>,
    ) -> Result<RecordSeries, StoreError> {
        Ok(self
            .series
            .get(symbol)
            .map_or_else(|| Arc::from(Vec::new()), |series| records_from(series, from)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Builder for [`InMemoryStore`].
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    series: HashMap<Symbol, Vec<Record>>,
}

impl InMemoryStoreBuilder {
    /// Add records for a symbol. Records may arrive in any order; repeated
    /// calls for the same symbol append.
    #[must_use]
    pub fn with_records(mut self, symbol: Symbol, records: impl IntoIterator<Item = Record>) -> Self {
        self.series.entry(symbol).or_default().extend(records);
        self
    }

    /// Sort every series and freeze the store.
    #[must_use]
    pub fn build(self) -> InMemoryStore {
        let series = self
            .series
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(symbol, mut records)| {
                sort_records(&mut records);
                (symbol, RecordSeries::from(records))
            })
            .collect();

        InMemoryStore { series }
    }
}
