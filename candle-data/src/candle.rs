use crate::{instrument::Symbol, session::CANDLE_INTERVAL, tick::Tick};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Composite storage key of a [`Candle`].
///
/// Ordered by symbol then minute, so a range scan over one symbol is contiguous.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct CandleKey {
    pub symbol: Symbol,
    pub minute: DateTime<Utc>,
}

impl CandleKey {
    pub fn new(symbol: Symbol, minute: DateTime<Utc>) -> Self {
        Self { symbol, minute }
    }
}

/// Origin of the data folded into a [`Candle`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleSource {
    Live,
    Historical,
    Merged,
}

impl CandleSource {
    fn combine(self, other: Self) -> Self {
        if self == other { self } else { Self::Merged }
    }
}

/// One-minute OHLC candle annotated with the largest single trade of the minute.
///
/// `first_trade_at` is the time of the first trade folded in, `last_trade_at` the latest trade
/// time seen. Historical candles carry the bucket start and bucket end respectively.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub date: NaiveDate,
    pub minute: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub max_trade_qty: u64,
    pub big_player: bool,
    pub first_trade_at: DateTime<Utc>,
    pub last_trade_at: DateTime<Utc>,
    pub source: CandleSource,
}

impl Candle {
    /// Open a live candle from the first [`Tick`] of its minute.
    pub fn from_tick(symbol: Symbol, date: NaiveDate, tick: &Tick, threshold: u64) -> Self {
        Self {
            symbol,
            date,
            minute: tick.minute(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
            max_trade_qty: tick.quantity,
            big_player: tick.quantity >= threshold,
            first_trade_at: tick.time,
            last_trade_at: tick.time,
            source: CandleSource::Live,
        }
    }

    /// Construct a candle from a historical OHLCV bar.
    ///
    /// Historical bars carry no per-trade information, so `max_trade_qty` is zero and the
    /// trade timestamps span the whole bucket.
    #[allow(clippy::too_many_arguments)]
    pub fn historical(
        symbol: Symbol,
        date: NaiveDate,
        minute: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            symbol,
            date,
            minute,
            open,
            high,
            low,
            close,
            volume,
            max_trade_qty: 0,
            big_player: false,
            first_trade_at: minute,
            last_trade_at: minute + CANDLE_INTERVAL - TimeDelta::milliseconds(1),
            source: CandleSource::Historical,
        }
    }

    pub fn key(&self) -> CandleKey {
        CandleKey::new(self.symbol.clone(), self.minute)
    }

    /// Fold a [`Tick`] of the same minute into the candle, in arrival order.
    pub fn apply_tick(&mut self, tick: &Tick, threshold: u64) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume = self.volume.saturating_add(tick.quantity);
        self.last_trade_at = self.last_trade_at.max(tick.time);
        self.record_trade_qty(tick.quantity, threshold);
    }

    /// Fold a late [`Tick`] into an already closed candle.
    ///
    /// Unlike [`Candle::apply_tick`], the close only moves if this tick is the latest
    /// timestamped trade seen for the minute.
    pub fn apply_late_tick(&mut self, tick: &Tick, threshold: u64) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        if tick.time >= self.last_trade_at {
            self.close = tick.price;
            self.last_trade_at = tick.time;
        }
        self.volume = self.volume.saturating_add(tick.quantity);
        self.record_trade_qty(tick.quantity, threshold);
        self.source = self.source.combine(CandleSource::Live);
    }

    fn record_trade_qty(&mut self, quantity: u64, threshold: u64) {
        self.max_trade_qty = self.max_trade_qty.max(quantity);
        self.big_player |= self.max_trade_qty >= threshold;
    }

    /// Merge another version of the same candle into this one.
    ///
    /// The merge is idempotent (`a.merge(a) == a`) and, except for exact timestamp ties where
    /// `self` wins, independent of the order versions arrive in:
    /// * high/volume/max_trade_qty take the maximum, low the minimum
    /// * big_player is sticky
    /// * open comes from the version with the earlier `first_trade_at`
    /// * close comes from the version with the later `last_trade_at`
    pub fn merge(&mut self, other: &Candle) {
        debug_assert_eq!(self.key(), other.key());

        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.volume = self.volume.max(other.volume);
        self.max_trade_qty = self.max_trade_qty.max(other.max_trade_qty);
        self.big_player |= other.big_player;

        if other.first_trade_at < self.first_trade_at {
            self.open = other.open;
            self.first_trade_at = other.first_trade_at;
        }
        if other.last_trade_at > self.last_trade_at {
            self.close = other.close;
            self.last_trade_at = other.last_trade_at;
        }

        self.source = self.source.combine(other.source);
    }

    /// Consuming variant of [`Candle::merge`].
    pub fn merged(mut self, other: &Candle) -> Self {
        self.merge(other);
        self
    }

    /// Determine if `high >= max(open, close) >= min(open, close) >= low`.
    pub fn is_consistent(&self) -> bool {
        let upper = self.open.max(self.close);
        let lower = self.open.min(self.close);
        matches!(
            self.high.partial_cmp(&upper),
            Some(Ordering::Greater | Ordering::Equal)
        ) && matches!(
            lower.partial_cmp(&self.low),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }
}
