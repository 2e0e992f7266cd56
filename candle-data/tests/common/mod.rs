#![allow(dead_code)]

use async_trait::async_trait;
use candle_data::{
    candle::Candle,
    config::{Config, FeedConfig, ReconcileConfig},
    error::DataError,
    feed::{FeedConnection, FeedConnector, FeedControl},
    instrument::{Instrument, InstrumentKey, InstrumentResolver, Symbol},
    reconcile::HistoricalFetcher,
    service::CandleService,
    session::{CANDLE_INTERVAL, ManualClock, MinuteRange},
    store::InMemoryCandleStore,
    tick::Tick,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use fnv::FnvHashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TATASTEEL_KEY: &str = "NSE_EQ|INE081A01020";
pub const INFY_KEY: &str = "NSE_EQ|INE009A01021";

/// 2024-06-03 at `hour:minute:second` UTC (IST is UTC+05:30, open 09:15 IST == 03:45 UTC).
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, hour, minute, second).unwrap()
}

pub fn trading_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
}

pub fn tatasteel() -> Symbol {
    Symbol::new("NSE", "TATASTEEL")
}

pub fn infy() -> Symbol {
    Symbol::new("NSE", "INFY")
}

pub fn tick(key: &str, time: DateTime<Utc>, price: f64, quantity: u64, sequence: u64) -> Tick {
    Tick {
        instrument: InstrumentKey::new(key),
        time,
        price,
        quantity,
        sequence,
    }
}

pub fn historical(symbol: Symbol, minute: DateTime<Utc>) -> Candle {
    Candle::historical(symbol, trading_date(), minute, 100.0, 101.0, 99.0, 100.5, 1_000)
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

pub struct StaticResolver {
    instruments: FnvHashMap<Symbol, Instrument>,
}

impl StaticResolver {
    pub fn nse() -> Self {
        let instruments = [(tatasteel(), TATASTEEL_KEY), (infy(), INFY_KEY)]
            .into_iter()
            .map(|(symbol, key)| {
                let instrument = Instrument {
                    symbol: symbol.clone(),
                    key: InstrumentKey::new(key),
                    exchange: "NSE".into(),
                    segment: "NSE_EQ".into(),
                };
                (symbol, instrument)
            })
            .collect();
        Self { instruments }
    }
}

impl InstrumentResolver for StaticResolver {
    fn resolve(&self, symbol: &Symbol) -> Result<Instrument, DataError> {
        self.instruments
            .get(symbol)
            .cloned()
            .ok_or_else(|| DataError::NotFound(symbol.to_string()))
    }
}

/// In-memory live feed whose connections are driven by the test.
#[derive(Default)]
pub struct FakeFeed {
    pub connects: AtomicUsize,
    pub subscribed: Mutex<Vec<(usize, Vec<InstrumentKey>)>>,
    pub unsubscribed: Mutex<Vec<InstrumentKey>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<Result<Tick, DataError>>>>,
}

impl FakeFeed {
    /// Send a tick on the most recent connection.
    pub fn push(&self, tick: Tick) {
        let senders = self.senders.lock();
        let sender = senders.last().expect("feed not connected");
        sender.send(Ok(tick)).expect("feed connection dropped");
    }

    /// Drop every open connection, forcing a reconnect.
    pub fn drop_connections(&self) {
        self.senders.lock().clear();
    }

    pub fn is_connected(&self) -> bool {
        !self.senders.lock().is_empty()
    }

    /// Determine if `key` was subscribed on connection number `connection`.
    pub fn is_subscribed(&self, connection: usize, key: &str) -> bool {
        self.subscribed.lock().iter().any(|(index, topics)| {
            *index == connection && topics.iter().any(|topic| topic.as_str() == key)
        })
    }

    /// Total number of subscribe requests issued for `key` across all connections.
    pub fn subscribe_count(&self, key: &str) -> usize {
        self.subscribed
            .lock()
            .iter()
            .flat_map(|(_, topics)| topics.iter())
            .filter(|topic| topic.as_str() == key)
            .count()
    }
}

pub struct FakeConnector(pub Arc<FakeFeed>);

struct FakeControl {
    connection: usize,
    feed: Arc<FakeFeed>,
}

#[async_trait]
impl FeedConnector for FakeConnector {
    async fn connect(&self) -> Result<FeedConnection, DataError> {
        let connection = self.0.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.senders.lock().push(tx);
        Ok(FeedConnection {
            control: Box::new(FakeControl {
                connection,
                feed: Arc::clone(&self.0),
            }),
            ticks: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

#[async_trait]
impl FeedControl for FakeControl {
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
        self.feed
            .subscribed
            .lock()
            .push((self.connection, instruments.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
        self.feed.unsubscribed.lock().extend_from_slice(instruments);
        Ok(())
    }
}

/// Historical source returning one candle per requested minute, except `holes`.
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    pub holes: Vec<DateTime<Utc>>,
    pub failures: Mutex<VecDeque<DataError>>,
    gate: Option<Semaphore>,
}

impl FakeFetcher {
    pub fn complete() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            holes: Vec::new(),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
        }
    }

    pub fn with_holes(holes: Vec<DateTime<Utc>>) -> Self {
        Self {
            holes,
            ..Self::complete()
        }
    }

    pub fn failing(failures: Vec<DataError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..Self::complete()
        }
    }

    /// Fetches block until [`FakeFetcher::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::complete()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }
}

#[async_trait]
impl HistoricalFetcher for FakeFetcher {
    async fn fetch_intraday(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        // Newest first and one minute past the end, as upstream sources tend to
        let mut candles = MinuteRange::new(start, end + CANDLE_INTERVAL)
            .minutes()
            .filter(|minute| !self.holes.contains(minute))
            .map(|minute| historical(instrument.symbol.clone(), minute))
            .collect::<Vec<_>>();
        candles.reverse();
        Ok(candles)
    }
}

pub struct Harness {
    pub service: CandleService,
    pub feed: Arc<FakeFeed>,
    pub fetcher: Arc<FakeFetcher>,
    pub store: Arc<InMemoryCandleStore>,
    pub clock: Arc<ManualClock>,
    next_sequence: AtomicU64,
}

impl Harness {
    /// Service with the clock at 10:00 IST on the trading date.
    pub fn start(fetcher: FakeFetcher) -> Self {
        Self::start_with(test_config(), fetcher)
    }

    pub fn start_with(config: Config, fetcher: FakeFetcher) -> Self {
        let feed = Arc::new(FakeFeed::default());
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(InMemoryCandleStore::new());
        let clock = Arc::new(ManualClock::new(at(4, 30, 0)));

        let service = CandleService::start(
            config,
            Arc::new(StaticResolver::nse()),
            Arc::new(FakeConnector(Arc::clone(&feed))),
            fetcher.clone(),
            store.clone(),
            clock.clone(),
        )
        .unwrap();

        Self {
            service,
            feed,
            fetcher,
            store,
            clock,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Push a tick with the next feed sequence number.
    pub fn trade(&self, key: &str, time: DateTime<Utc>, price: f64, quantity: u64) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.feed.push(tick(key, time, price, quantity, sequence));
        sequence
    }

    pub async fn candle(&self, symbol: &Symbol, minute: DateTime<Utc>) -> Option<Candle> {
        self.service
            .get_candles(symbol, trading_date())
            .await
            .unwrap()
            .into_iter()
            .find(|candle| candle.minute == minute)
    }

    /// Poll until the candle at `minute` satisfies `condition`.
    pub async fn wait_for_candle<F>(&self, symbol: &Symbol, minute: DateTime<Utc>, condition: F) -> Candle
    where
        F: Fn(&Candle) -> bool,
    {
        for _ in 0..2000 {
            if let Some(candle) = self.candle(symbol, minute).await {
                if condition(&candle) {
                    return candle;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("candle at {minute} never satisfied condition");
    }
}

pub fn test_config() -> Config {
    Config::default()
        .with_feed(FeedConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            ..FeedConfig::default()
        })
        .with_reconcile(ReconcileConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            fetch_timeout: Duration::from_secs(2),
        })
}
