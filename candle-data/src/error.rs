use crate::instrument::{InstrumentKey, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `candle-data`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("invalid symbol '{0}', expected EXCHANGE:TICKER")]
    InvalidSymbol(String),

    #[error("instrument not found for symbol: {0}")]
    NotFound(String),

    #[error("instrument reference cache is stale, last loaded at {loaded_at:?}")]
    InstrumentCacheStale { loaded_at: Option<DateTime<Utc>> },

    #[error("TransientNetwork: {0}")]
    TransientNetwork(String),

    #[error("request rejected by upstream: {0}")]
    Rejected(String),

    #[error("failed to deserialise payload: {0}")]
    Deserialise(String),

    #[error("DataGap for {symbol}: [{start}, {end}) unresolved: {reason}")]
    DataGap {
        symbol: Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reason: String,
    },

    #[error("duplicate or stale tick dropped: {instrument} sequence {sequence}")]
    DuplicateOrStaleTick {
        instrument: InstrumentKey,
        sequence: u64,
    },

    #[error("PersistenceWrite: {0}")]
    PersistenceWrite(String),

    #[error("subscription closed for: {0}")]
    SubscriptionClosed(Symbol),

    #[error("feed client terminated")]
    FeedTerminated,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DataError {
    /// Determine if an operation that failed with this error is worth retrying.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::TransientNetwork(_) | DataError::PersistenceWrite(_) => true,
            _ => false,
        }
    }

    /// Determine if this error should take down the whole service rather than a single
    /// symbol pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DataError::Config(_))
    }
}

impl From<reqwest::Error> for DataError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Deserialise(error.to_string())
        } else {
            Self::TransientNetwork(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientNetwork(error.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(error: serde_json::Error) -> Self {
        Self::Deserialise(error.to_string())
    }
}
