use crate::{
    candle::{Candle, CandleKey},
    error::DataError,
    instrument::Symbol,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Keyed candle storage collaborator.
///
/// Implementations only need plain get/put semantics, merge precedence and retention are
/// enforced by the [`PersistenceGateway`](crate::gateway::PersistenceGateway).
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn get(&self, key: &CandleKey) -> Result<Option<Candle>, DataError>;

    /// Insert or replace the candle stored at [`Candle::key`].
    async fn put(&self, candle: Candle) -> Result<(), DataError>;

    /// All candles of `symbol` with `from <= minute < to`, ordered by minute.
    async fn range(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;

    /// Delete every candle with `minute < cutoff`, returning the number deleted.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DataError>;
}

/// In-memory [`CandleStore`] backed by a [`BTreeMap`] ordered by [`CandleKey`].
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    candles: RwLock<BTreeMap<CandleKey, Candle>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.read().is_empty()
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn get(&self, key: &CandleKey) -> Result<Option<Candle>, DataError> {
        Ok(self.candles.read().get(key).cloned())
    }

    async fn put(&self, candle: Candle) -> Result<(), DataError> {
        self.candles.write().insert(candle.key(), candle);
        Ok(())
    }

    async fn range(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        if to <= from {
            return Ok(Vec::new());
        }

        let start = CandleKey::new(symbol.clone(), from);
        let end = CandleKey::new(symbol.clone(), to);
        Ok(self
            .candles
            .read()
            .range(start..end)
            .map(|(_, candle)| candle.clone())
            .collect())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DataError> {
        let mut candles = self.candles.write();
        let before = candles.len();
        candles.retain(|key, _| key.minute >= cutoff);
        Ok(before - candles.len())
    }
}
