use crate::{instrument::InstrumentKey, session::minute_bucket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalised last-traded-price update for a single instrument.
///
/// `sequence` is monotonic per instrument as published by the feed.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Tick {
    pub instrument: InstrumentKey,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub quantity: u64,
    pub sequence: u64,
}

impl Tick {
    /// Determine if the tick carries a usable price and traded quantity.
    pub fn is_complete(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.quantity > 0
    }

    /// Start of the one-minute bucket this tick belongs to.
    pub fn minute(&self) -> DateTime<Utc> {
        minute_bucket(self.time)
    }
}
