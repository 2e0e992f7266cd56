use crate::{
    candle::Candle,
    config::Config,
    error::DataError,
    feed::{FeedConnector, FeedStatsSnapshot, TickStreamClient},
    gateway::PersistenceGateway,
    instrument::{InstrumentResolver, Symbol},
    reconcile::{GapReconciler, HistoricalFetcher},
    registry::{SubscriptionHandle, SubscriptionRegistry},
    session::{Clock, MarketSession},
    store::CandleStore,
};
use chrono::NaiveDate;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Longest [`CandleService::shutdown`] waits for queued candles to be written.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fully wired ingestion pipeline.
///
/// Owns the feed dispatcher, the persistence gateway writer, the retention sweep and the
/// [`SubscriptionRegistry`], and exposes the alert intake and consumer read interfaces.
pub struct CandleService {
    config: Config,
    session: MarketSession,
    registry: SubscriptionRegistry,
    gateway: PersistenceGateway,
    feed: TickStreamClient,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CandleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleService")
            .field("session", &self.session)
            .field("registry", &self.registry)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl CandleService {
    /// Validate `config` and start the feed dispatcher, gateway writer and retention sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Config,
        resolver: Arc<dyn InstrumentResolver>,
        connector: Arc<dyn FeedConnector>,
        fetcher: Arc<dyn HistoricalFetcher>,
        store: Arc<dyn CandleStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DataError> {
        config.validate()?;
        let session = config.session()?;

        let gateway =
            PersistenceGateway::spawn(store, config.persistence, Arc::clone(&clock));
        let (feed, feed_task) = TickStreamClient::spawn(connector, config.feed);
        let reconciler = GapReconciler::new(
            gateway.clone(),
            fetcher,
            session,
            config.reconcile,
        );
        let registry = SubscriptionRegistry::new(
            resolver,
            feed.clone(),
            gateway.clone(),
            reconciler,
            session,
            clock,
            config.big_player.clone(),
            config.late_tick_policy,
        );
        let purge_task = tokio::spawn(run_retention_sweep(
            gateway.clone(),
            config.persistence.purge_interval,
        ));

        info!(
            market_open = %config.session.market_open,
            market_close = %config.session.market_close,
            retention_days = config.persistence.retention_days,
            big_player_threshold = config.big_player.default_threshold,
            late_tick_policy = ?config.late_tick_policy,
            "candle service started"
        );

        Ok(Self {
            config,
            session,
            registry,
            gateway,
            feed,
            tasks: Mutex::new(vec![feed_task, purge_task]),
        })
    }

    /// Alert intake for `"EXCHANGE:TICKER"` symbols.
    ///
    /// Idempotent and non-blocking: the subscription is created in the background, repeated
    /// alerts for a subscribed symbol have no effect. Only a malformed symbol is reported to the
    /// caller, resolution failures are logged.
    pub fn handle_scanner_alert(&self, raw: &str) -> Result<Symbol, DataError> {
        let symbol = Symbol::parse(raw)?;

        let registry = self.registry.clone();
        let alerted = symbol.clone();
        tokio::spawn(async move {
            match registry.subscribe(&alerted).await {
                Ok(handle) => info!(symbol = %alerted, state = ?handle.state(), "scanner alert handled"),
                Err(error) => warn!(symbol = %alerted, %error, "scanner alert not subscribed"),
            }
        });

        Ok(symbol)
    }

    /// Subscribe `symbol`, see [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(&self, symbol: &Symbol) -> Result<SubscriptionHandle, DataError> {
        self.registry.subscribe(symbol).await
    }

    /// Unsubscribe `symbol`, see [`SubscriptionRegistry::unsubscribe`].
    pub async fn unsubscribe(&self, symbol: &Symbol) -> bool {
        self.registry.unsubscribe(symbol).await
    }

    /// Every candle of `symbol` on trading `date`, ordered by minute.
    ///
    /// Candles older than the retention window are never returned.
    pub async fn get_candles(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
    ) -> Result<Vec<Candle>, DataError> {
        let (start, end) = self.session.day_bounds(date);
        self.gateway.read_range(symbol, date, start..end).await
    }

    /// Stream of every candle of `symbol` persisted from now on, including late corrections.
    pub fn stream_live_updates(&self, symbol: Symbol) -> BoxStream<'static, Candle> {
        self.gateway.live_updates(symbol)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    pub fn session(&self) -> &MarketSession {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feed_stats(&self) -> FeedStatsSnapshot {
        self.feed.stats()
    }

    /// Close every subscription, stop the feed and write out queued candles.
    pub async fn shutdown(&self) {
        info!("candle service shutting down");
        self.registry.shutdown().await;
        self.feed.shutdown();

        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.gateway.shutdown())
            .await
            .is_err()
        {
            error!(
                queued = self.gateway.queued(),
                timeout = ?SHUTDOWN_FLUSH_TIMEOUT,
                "timed out writing queued candles, remaining candles are lost"
            );
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!(stats = ?self.gateway.stats(), feed = ?self.feed.stats(), "candle service stopped");
    }
}

async fn run_retention_sweep(gateway: PersistenceGateway, interval: Duration) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(error) = gateway.purge_expired().await {
            warn!(%error, "retention sweep failed");
        }
    }
}
