use crate::{error::DataError, session::Clock};
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Display, From};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, sync::Arc};
use tracing::info;

/// Maximum age of the reference data before [`InstrumentCache`] refuses to resolve from it.
pub const INSTRUMENT_CACHE_MAX_AGE: TimeDelta = TimeDelta::hours(24);

/// Human-readable instrument symbol in `EXCHANGE:TICKER` form, eg/ "NSE:TATASTEEL".
///
/// Validated once at the boundary, all internal maps and storage keys use this type.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(SmolStr);

impl Symbol {
    /// Parse a `EXCHANGE:TICKER` symbol.
    pub fn parse(raw: &str) -> Result<Self, DataError> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((exchange, ticker))
                if !exchange.is_empty()
                    && !ticker.is_empty()
                    && !ticker.contains(':')
                    && raw.chars().all(|c| !c.is_whitespace()) =>
            {
                Ok(Self::new(exchange, ticker))
            }
            _ => Err(DataError::InvalidSymbol(raw.to_string())),
        }
    }

    /// Construct a [`Symbol`] from its exchange and ticker parts.
    pub fn new(exchange: &str, ticker: &str) -> Self {
        Self(SmolStr::new(format!(
            "{}:{}",
            exchange.to_ascii_uppercase(),
            ticker.to_ascii_uppercase()
        )))
    }

    pub fn exchange(&self) -> &str {
        self.0.split_once(':').map(|(exchange, _)| exchange).unwrap_or("")
    }

    pub fn ticker(&self) -> &str {
        self.0.split_once(':').map(|(_, ticker)| ticker).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0.to_string()
    }
}

/// Stable feed identifier of an instrument, eg/ "NSE_EQ|INE081A01020".
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct InstrumentKey(pub SmolStr);

impl InstrumentKey {
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        Self(SmolStr::new(key))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Immutable reference record describing a tradable instrument.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub key: InstrumentKey,
    pub exchange: SmolStr,
    pub segment: SmolStr,
}

/// Lookup interface mapping a [`Symbol`] to its [`Instrument`].
pub trait InstrumentResolver: Send + Sync {
    /// Resolve the [`Instrument`] for a [`Symbol`], failing with [`DataError::NotFound`] if the
    /// reference data does not contain it.
    fn resolve(&self, symbol: &Symbol) -> Result<Instrument, DataError>;
}

/// Raw reference-data record as published in the exchange instrument master file.
///
/// ### Raw Payload Example
/// ```json
/// {
///     "segment": "NSE_EQ",
///     "name": "TATA STEEL LIMITED",
///     "exchange": "NSE",
///     "instrument_key": "NSE_EQ|INE081A01020",
///     "trading_symbol": "TATASTEEL"
/// }
/// ```
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct InstrumentRecord {
    pub instrument_key: String,
    pub exchange: String,
    pub segment: String,
    pub trading_symbol: String,
}

#[derive(Debug, Default)]
struct CacheState {
    by_symbol: FnvHashMap<Symbol, Instrument>,
    by_key: FnvHashMap<InstrumentKey, Symbol>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Reference-data backed [`InstrumentResolver`].
///
/// The cache is refreshed externally (at most once per day). Once the loaded data is older than
/// [`INSTRUMENT_CACHE_MAX_AGE`] every lookup fails with [`DataError::InstrumentCacheStale`]
/// rather than silently using stale mappings.
pub struct InstrumentCache {
    segment: Option<SmolStr>,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl fmt::Debug for InstrumentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("InstrumentCache")
            .field("segment", &self.segment)
            .field("instruments", &state.by_symbol.len())
            .field("loaded_at", &state.loaded_at)
            .finish()
    }
}

impl InstrumentCache {
    /// Construct an empty cache. If `segment` is provided, only records of that segment
    /// (eg/ "NSE_EQ") are retained on refresh.
    pub fn new(segment: Option<&str>, clock: Arc<dyn Clock>) -> Self {
        Self {
            segment: segment.map(SmolStr::new),
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Replace the cached reference data, returning the number of instruments retained.
    pub fn refresh<Iter>(&self, records: Iter) -> usize
    where
        Iter: IntoIterator<Item = InstrumentRecord>,
    {
        let mut next = CacheState {
            loaded_at: Some(self.clock.now()),
            ..CacheState::default()
        };

        for record in records {
            if let Some(segment) = &self.segment {
                if record.segment != segment.as_str() {
                    continue;
                }
            }

            let symbol = Symbol::new(&record.exchange, &record.trading_symbol);
            let instrument = Instrument {
                symbol: symbol.clone(),
                key: InstrumentKey::new(&record.instrument_key),
                exchange: SmolStr::new(&record.exchange),
                segment: SmolStr::new(&record.segment),
            };
            next.by_key.insert(instrument.key.clone(), symbol.clone());
            next.by_symbol.insert(symbol, instrument);
        }

        let count = next.by_symbol.len();
        *self.state.write() = next;
        info!(instruments = count, segment = ?self.segment, "instrument cache refreshed");
        count
    }

    /// Replace the cached reference data from a JSON array of [`InstrumentRecord`]s.
    pub fn refresh_from_json(&self, json: &str) -> Result<usize, DataError> {
        let records = serde_json::from_str::<Vec<InstrumentRecord>>(json)?;
        Ok(self.refresh(records))
    }

    /// Determine if the cached reference data is missing or older than
    /// [`INSTRUMENT_CACHE_MAX_AGE`].
    pub fn is_stale(&self) -> bool {
        match self.state.read().loaded_at {
            Some(loaded_at) => self.clock.now() - loaded_at >= INSTRUMENT_CACHE_MAX_AGE,
            None => true,
        }
    }

    /// Reverse lookup of the [`Symbol`] trading under an [`InstrumentKey`].
    pub fn symbol_for(&self, key: &InstrumentKey) -> Option<Symbol> {
        self.state.read().by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InstrumentResolver for InstrumentCache {
    fn resolve(&self, symbol: &Symbol) -> Result<Instrument, DataError> {
        if self.is_stale() {
            return Err(DataError::InstrumentCacheStale {
                loaded_at: self.state.read().loaded_at,
            });
        }

        self.state
            .read()
            .by_symbol
            .get(symbol)
            .cloned()
            .ok_or_else(|| DataError::NotFound(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;
    use chrono::TimeZone;

    fn record(key: &str, segment: &str, ticker: &str) -> InstrumentRecord {
        InstrumentRecord {
            instrument_key: key.to_string(),
            exchange: "NSE".to_string(),
            segment: segment.to_string(),
            trading_symbol: ticker.to_string(),
        }
    }

    #[test]
    fn test_symbol_parse() {
        struct TestCase {
            input: &'static str,
            expected: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: valid symbol
                input: "NSE:TATASTEEL",
                expected: Some("NSE:TATASTEEL"),
            },
            TestCase {
                // TC1: lowercase is normalised
                input: "nse:reliance",
                expected: Some("NSE:RELIANCE"),
            },
            TestCase {
                // TC2: surrounding whitespace is trimmed
                input: "  NSE:INFY ",
                expected: Some("NSE:INFY"),
            },
            TestCase {
                // TC3: missing exchange
                input: ":INFY",
                expected: None,
            },
            TestCase {
                // TC4: missing separator
                input: "INFY",
                expected: None,
            },
            TestCase {
                // TC5: too many separators
                input: "NSE:INFY:EQ",
                expected: None,
            },
            TestCase {
                // TC6: embedded whitespace
                input: "NSE:TATA STEEL",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = Symbol::parse(test.input).ok();
            let actual = actual.as_ref().map(Symbol::as_str);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_symbol_parts_and_serde() {
        let symbol = Symbol::parse("NSE:TATASTEEL").unwrap();
        assert_eq!(symbol.exchange(), "NSE");
        assert_eq!(symbol.ticker(), "TATASTEEL");

        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"NSE:TATASTEEL\"");
        assert_eq!(serde_json::from_str::<Symbol>(&json).unwrap(), symbol);
        assert!(serde_json::from_str::<Symbol>("\"TATASTEEL\"").is_err());
    }

    #[test]
    fn test_instrument_cache_resolve_and_reverse_lookup() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap(),
        ));
        let cache = InstrumentCache::new(Some("NSE_EQ"), clock);

        let retained = cache.refresh([
            record("NSE_EQ|INE081A01020", "NSE_EQ", "TATASTEEL"),
            record("NSE_EQ|INE002A01018", "NSE_EQ", "RELIANCE"),
            record("NSE_FO|12345", "NSE_FO", "NIFTY24JUNFUT"),
        ]);
        assert_eq!(retained, 2);

        let symbol = Symbol::parse("NSE:TATASTEEL").unwrap();
        let instrument = cache.resolve(&symbol).unwrap();
        assert_eq!(instrument.key, InstrumentKey::new("NSE_EQ|INE081A01020"));
        assert_eq!(instrument.segment, "NSE_EQ");
        assert_eq!(cache.symbol_for(&instrument.key), Some(symbol));

        let filtered = Symbol::parse("NSE:NIFTY24JUNFUT").unwrap();
        assert_eq!(
            cache.resolve(&filtered),
            Err(DataError::NotFound("NSE:NIFTY24JUNFUT".to_string()))
        );
    }

    #[test]
    fn test_instrument_cache_refuses_stale_data() {
        let loaded_at = Utc.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(loaded_at));
        let cache = InstrumentCache::new(None, clock.clone());
        let symbol = Symbol::parse("NSE:TATASTEEL").unwrap();

        // Never loaded
        assert!(matches!(
            cache.resolve(&symbol),
            Err(DataError::InstrumentCacheStale { loaded_at: None })
        ));

        cache
            .refresh_from_json(
                r#"[{"instrument_key":"NSE_EQ|INE081A01020","exchange":"NSE","segment":"NSE_EQ","trading_symbol":"TATASTEEL","name":"TATA STEEL LIMITED"}]"#,
            )
            .unwrap();
        assert!(cache.resolve(&symbol).is_ok());

        clock.advance(TimeDelta::hours(23));
        assert!(cache.resolve(&symbol).is_ok());

        clock.advance(TimeDelta::hours(1));
        assert_eq!(
            cache.resolve(&symbol),
            Err(DataError::InstrumentCacheStale {
                loaded_at: Some(loaded_at)
            })
        );
    }
}
