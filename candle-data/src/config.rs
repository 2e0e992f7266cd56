use crate::{error::DataError, instrument::Symbol, session::MarketSession};
use chrono::{FixedOffset, NaiveTime, TimeDelta};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// Complete service configuration.
///
/// Every section has sensible defaults, so a JSON config file only needs the values that differ,
/// and environment variables (see [`Config::from_env`]) overlay the result.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub feed: FeedConfig,
    pub reconcile: ReconcileConfig,
    pub persistence: PersistenceConfig,
    pub big_player: BigPlayerConfig,
    pub late_tick_policy: LateTickPolicy,
}

/// Exchange trading hours in exchange local time.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            market_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            market_close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset_minutes: 330,
        }
    }
}

/// Live feed connection behaviour.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    #[serde(rename = "reconnect_base_ms", with = "duration_ms")]
    pub reconnect_base: Duration,
    #[serde(rename = "reconnect_max_ms", with = "duration_ms")]
    pub reconnect_max: Duration,
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,
    /// Sequence distance beyond which an out of order tick is treated as a gap signal.
    pub sequence_tolerance: u64,
    /// Number of recent sequence numbers remembered per instrument for de-duplication.
    pub dedup_window: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            sequence_tolerance: 64,
            dedup_window: 4096,
        }
    }
}

/// Historical backfill retry budget.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    #[serde(rename = "base_backoff_ms", with = "duration_ms")]
    pub base_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    #[serde(rename = "fetch_timeout_ms", with = "duration_ms")]
    pub fetch_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub retention_days: u32,
    /// Maximum number of closed candles waiting for the writer before the oldest is dropped.
    pub write_queue_capacity: usize,
    pub write_retries: u32,
    #[serde(rename = "write_backoff_ms", with = "duration_ms")]
    pub write_backoff: Duration,
    #[serde(rename = "purge_interval_ms", with = "duration_ms")]
    pub purge_interval: Duration,
    /// Capacity of the live update broadcast, slow consumers lag past this.
    pub updates_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            write_queue_capacity: 1024,
            write_retries: 3,
            write_backoff: Duration::from_millis(100),
            purge_interval: Duration::from_secs(24 * 60 * 60),
            updates_capacity: 1024,
        }
    }
}

impl PersistenceConfig {
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.retention_days))
    }
}

/// Single trade quantity at or above which a candle is flagged as "Big Player" volume.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BigPlayerConfig {
    pub default_threshold: u64,
    pub overrides: FnvHashMap<Symbol, u64>,
}

impl Default for BigPlayerConfig {
    fn default() -> Self {
        Self {
            default_threshold: 10_000,
            overrides: FnvHashMap::default(),
        }
    }
}

impl BigPlayerConfig {
    pub fn threshold_for(&self, symbol: &Symbol) -> u64 {
        self.overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// What to do with a tick whose minute is older than the candle currently being built.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LateTickPolicy {
    /// Merge the tick into the persisted candle and re-publish it.
    #[default]
    Merge,
    /// Drop the tick.
    Drop,
}

impl FromStr for LateTickPolicy {
    type Err = DataError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "drop" => Ok(Self::Drop),
            other => Err(DataError::Config(format!(
                "unknown late tick policy '{other}', expected merge or drop"
            ))),
        }
    }
}

impl Config {
    /// Parse a JSON config document, missing values fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, DataError> {
        serde_json::from_str(json).map_err(|error| DataError::Config(error.to_string()))
    }

    /// Default [`Config`] overlaid with `CANDLE_*` environment variables.
    pub fn from_env() -> Result<Self, DataError> {
        Self::default().with_env_overrides()
    }

    /// Overlay `CANDLE_*` environment variables onto this [`Config`].
    ///
    /// | Variable | Format |
    /// |----------|--------|
    /// | `CANDLE_MARKET_OPEN` / `CANDLE_MARKET_CLOSE` | `HH:MM` |
    /// | `CANDLE_UTC_OFFSET_MINUTES` | `330` |
    /// | `CANDLE_BIG_PLAYER_THRESHOLD` | `10000` |
    /// | `CANDLE_BIG_PLAYER_OVERRIDES` | `NSE:TATASTEEL=50000,NSE:INFY=20000` |
    /// | `CANDLE_LATE_TICK_POLICY` | `merge` or `drop` |
    /// | `CANDLE_RETENTION_DAYS` | `7` |
    /// | `CANDLE_WRITE_QUEUE_CAPACITY` | `1024` |
    /// | `CANDLE_FETCH_TIMEOUT_MS` | `10000` |
    /// | `CANDLE_FETCH_ATTEMPTS` | `3` |
    /// | `CANDLE_FEED_READ_TIMEOUT_MS` | `120000` |
    pub fn with_env_overrides(self) -> Result<Self, DataError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay variables provided by `lookup`, see [`Config::with_env_overrides`].
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, DataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(open) = lookup("CANDLE_MARKET_OPEN") {
            self.session.market_open = parse_time("CANDLE_MARKET_OPEN", &open)?;
        }
        if let Some(close) = lookup("CANDLE_MARKET_CLOSE") {
            self.session.market_close = parse_time("CANDLE_MARKET_CLOSE", &close)?;
        }
        if let Some(offset) = lookup("CANDLE_UTC_OFFSET_MINUTES") {
            self.session.utc_offset_minutes = parse_var("CANDLE_UTC_OFFSET_MINUTES", &offset)?;
        }
        if let Some(threshold) = lookup("CANDLE_BIG_PLAYER_THRESHOLD") {
            self.big_player.default_threshold =
                parse_var("CANDLE_BIG_PLAYER_THRESHOLD", &threshold)?;
        }
        if let Some(overrides) = lookup("CANDLE_BIG_PLAYER_OVERRIDES") {
            for entry in overrides.split(',').filter(|entry| !entry.trim().is_empty()) {
                let (symbol, threshold) = entry.split_once('=').ok_or_else(|| {
                    DataError::Config(format!(
                        "CANDLE_BIG_PLAYER_OVERRIDES entry '{entry}' is not SYMBOL=THRESHOLD"
                    ))
                })?;
                let symbol = Symbol::parse(symbol)
                    .map_err(|error| DataError::Config(error.to_string()))?;
                let threshold = parse_var("CANDLE_BIG_PLAYER_OVERRIDES", threshold)?;
                self.big_player.overrides.insert(symbol, threshold);
            }
        }
        if let Some(policy) = lookup("CANDLE_LATE_TICK_POLICY") {
            self.late_tick_policy = policy.parse()?;
        }
        if let Some(days) = lookup("CANDLE_RETENTION_DAYS") {
            self.persistence.retention_days = parse_var("CANDLE_RETENTION_DAYS", &days)?;
        }
        if let Some(capacity) = lookup("CANDLE_WRITE_QUEUE_CAPACITY") {
            self.persistence.write_queue_capacity =
                parse_var("CANDLE_WRITE_QUEUE_CAPACITY", &capacity)?;
        }
        if let Some(timeout) = lookup("CANDLE_FETCH_TIMEOUT_MS") {
            self.reconcile.fetch_timeout =
                Duration::from_millis(parse_var("CANDLE_FETCH_TIMEOUT_MS", &timeout)?);
        }
        if let Some(attempts) = lookup("CANDLE_FETCH_ATTEMPTS") {
            self.reconcile.max_attempts = parse_var("CANDLE_FETCH_ATTEMPTS", &attempts)?;
        }
        if let Some(timeout) = lookup("CANDLE_FEED_READ_TIMEOUT_MS") {
            self.feed.read_timeout =
                Duration::from_millis(parse_var("CANDLE_FEED_READ_TIMEOUT_MS", &timeout)?);
        }

        Ok(self)
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Set the global big player threshold.
    pub fn with_big_player_threshold(mut self, threshold: u64) -> Self {
        self.big_player.default_threshold = threshold;
        self
    }

    /// Set a per-symbol big player threshold.
    pub fn with_big_player_override(mut self, symbol: Symbol, threshold: u64) -> Self {
        self.big_player.overrides.insert(symbol, threshold);
        self
    }

    pub fn with_late_tick_policy(mut self, policy: LateTickPolicy) -> Self {
        self.late_tick_policy = policy;
        self
    }

    /// Reject configuration the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), DataError> {
        self.session()?;

        let checks = [
            (
                self.session.market_close > self.session.market_open,
                "market_close must be after market_open",
            ),
            (
                self.big_player.default_threshold > 0
                    && self.big_player.overrides.values().all(|threshold| *threshold > 0),
                "big player thresholds must be positive",
            ),
            (
                self.persistence.retention_days > 0,
                "retention_days must be positive",
            ),
            (
                self.persistence.write_queue_capacity > 0,
                "write_queue_capacity must be positive",
            ),
            (
                self.persistence.updates_capacity > 0,
                "updates_capacity must be positive",
            ),
            (
                !self.persistence.purge_interval.is_zero(),
                "purge_interval must be positive",
            ),
            (
                self.reconcile.max_attempts > 0,
                "reconcile max_attempts must be positive",
            ),
            (
                self.reconcile.base_backoff <= self.reconcile.max_backoff,
                "reconcile base_backoff exceeds max_backoff",
            ),
            (
                !self.reconcile.fetch_timeout.is_zero(),
                "fetch_timeout must be positive",
            ),
            (
                self.feed.reconnect_base <= self.feed.reconnect_max,
                "feed reconnect_base exceeds reconnect_max",
            ),
            (
                !self.feed.read_timeout.is_zero(),
                "feed read_timeout must be positive",
            ),
            (self.feed.dedup_window > 0, "feed dedup_window must be positive"),
        ];

        match checks.into_iter().find(|(valid, _)| !valid) {
            Some((_, reason)) => Err(DataError::Config(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Construct the [`MarketSession`] described by [`SessionConfig`].
    pub fn session(&self) -> Result<MarketSession, DataError> {
        let offset = FixedOffset::east_opt(self.session.utc_offset_minutes * 60).ok_or_else(|| {
            DataError::Config(format!(
                "utc_offset_minutes {} out of range",
                self.session.utc_offset_minutes
            ))
        })?;

        Ok(MarketSession::new(
            self.session.market_open,
            self.session.market_close,
            offset,
        ))
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, DataError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|error| DataError::Config(format!("{name}='{value}': {error}")))
}

fn parse_time(name: &str, value: &str) -> Result<NaiveTime, DataError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
        .map_err(|error| DataError::Config(format!("{name}='{value}': {error}")))
}

/// Serialise [`Duration`]s as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
