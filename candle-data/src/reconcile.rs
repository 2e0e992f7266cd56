use crate::{
    candle::Candle,
    config::ReconcileConfig,
    error::DataError,
    feed::backoff::Backoff,
    gateway::PersistenceGateway,
    instrument::{Instrument, Symbol},
    session::{CANDLE_INTERVAL, MarketSession, MinuteRange, minute_bucket},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashSet;
use itertools::Itertools;
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// Historical one-minute candle source used to backfill gaps.
#[async_trait]
pub trait HistoricalFetcher: Send + Sync {
    /// Fetch the one-minute candles of `instrument` with `start <= minute < end`.
    ///
    /// Fails with [`DataError::NotFound`] if the upstream does not know the instrument, which
    /// is never retried.
    async fn fetch_intraday(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;
}

/// Why a range of minutes could not be backfilled.
#[derive(Clone, PartialEq, Debug)]
pub enum GapReason {
    /// Retry budget exhausted, or a non-retryable upstream error.
    Failed { attempts: u32, error: DataError },
    /// Upstream does not know the instrument.
    NotFound,
    /// Fetch succeeded but contained no candle for these minutes (no trades).
    NoData,
    /// Fetched candles could not be persisted.
    Persistence(DataError),
    /// Subscription started inside the minute, trades before `live_from` were not observed.
    PartialMinute { live_from: DateTime<Utc> },
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapReason::Failed { attempts, error } => {
                write!(f, "fetch failed after {attempts} attempt(s): {error}")
            }
            GapReason::NotFound => f.write_str("instrument unknown to historical source"),
            GapReason::NoData => f.write_str("no historical data"),
            GapReason::Persistence(error) => write!(f, "persistence failed: {error}"),
            GapReason::PartialMinute { live_from } => {
                write!(f, "live from {live_from}, earlier trades of the minute not observed")
            }
        }
    }
}

/// Contiguous minutes left unresolved by a reconciliation.
#[derive(Clone, PartialEq, Debug)]
pub struct DataGap {
    pub range: MinuteRange,
    pub reason: GapReason,
}

impl DataGap {
    pub fn to_error(&self, symbol: &Symbol) -> DataError {
        DataError::DataGap {
            symbol: symbol.clone(),
            start: self.range.start,
            end: self.range.end,
            reason: self.reason.to_string(),
        }
    }
}

/// Outcome of reconciling a coverage window.
#[derive(Clone, PartialEq, Debug)]
pub struct ReconcileReport {
    pub symbol: Symbol,
    /// Window that was reconciled, `None` if nothing needed backfilling.
    pub window: Option<MinuteRange>,
    /// Minutes already present before reconciliation.
    pub existing: usize,
    /// Candles fetched and persisted.
    pub filled: usize,
    pub gaps: Vec<DataGap>,
}

impl ReconcileReport {
    fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            window: None,
            existing: 0,
            filled: 0,
            gaps: Vec::new(),
        }
    }

    /// Determine if every minute of the window is present.
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Number of minutes left unresolved.
    pub fn gap_minutes(&self) -> usize {
        self.gaps.iter().map(|gap| gap.range.len()).sum()
    }
}

/// Backfills the minutes between market open and a subscription from a [`HistoricalFetcher`].
///
/// Gaps are non-fatal: anything that cannot be fetched within the retry budget is recorded in
/// the [`ReconcileReport`] and logged, and the subscription carries on.
#[derive(Clone)]
pub struct GapReconciler {
    gateway: PersistenceGateway,
    fetcher: Arc<dyn HistoricalFetcher>,
    session: MarketSession,
    config: ReconcileConfig,
}

impl fmt::Debug for GapReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GapReconciler")
            .field("session", &self.session)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GapReconciler {
    pub fn new(
        gateway: PersistenceGateway,
        fetcher: Arc<dyn HistoricalFetcher>,
        session: MarketSession,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            gateway,
            fetcher,
            session,
            config,
        }
    }

    /// Reconcile `[market open, subscribed_at)` of the subscription's trading date.
    ///
    /// Complete minutes before the subscription are backfilled. The minute the subscription
    /// started in, if it started mid-minute, is recorded as a [`GapReason::PartialMinute`].
    pub async fn reconcile_subscription(
        &self,
        instrument: &Instrument,
        subscribed_at: DateTime<Utc>,
    ) -> ReconcileReport {
        let symbol = &instrument.symbol;
        let mut report = match self.session.coverage_window(subscribed_at) {
            Some(window) => self.reconcile(instrument, window).await,
            None => {
                debug!(%symbol, %subscribed_at, "no complete session minute before subscription");
                ReconcileReport::empty(symbol.clone())
            }
        };

        if let Some(range) = self.session.partial_minute(subscribed_at) {
            let gap = DataGap {
                range,
                reason: GapReason::PartialMinute {
                    live_from: subscribed_at,
                },
            };
            warn!(error = %gap.to_error(symbol), "unresolved data gap");
            report.gaps.push(gap);
        }

        report
    }

    /// Make every minute of `window` either present in the store or recorded as a gap.
    pub async fn reconcile(&self, instrument: &Instrument, window: MinuteRange) -> ReconcileReport {
        let symbol = &instrument.symbol;
        let mut report = ReconcileReport {
            window: Some(window),
            ..ReconcileReport::empty(symbol.clone())
        };
        if window.is_empty() {
            return report;
        }

        let date = self.session.local_date(window.start);
        let present = match self
            .gateway
            .read_range(symbol, date, window.start..window.end)
            .await
        {
            Ok(candles) => candles
                .into_iter()
                .map(|candle| candle.minute)
                .collect::<FnvHashSet<_>>(),
            Err(error) => {
                warn!(%symbol, %error, "failed to read existing candles, treating window as missing");
                FnvHashSet::default()
            }
        };
        report.existing = present.len();

        let missing = missing_ranges(window, &present);
        info!(
            %symbol,
            %window,
            existing = report.existing,
            missing_ranges = missing.len(),
            "reconciling coverage window"
        );

        for range in missing {
            match self.fetch_with_retry(instrument, range).await {
                Ok(candles) => self.persist(instrument, range, candles, &mut report).await,
                Err(reason) => report.gaps.push(DataGap { range, reason }),
            }
        }

        for gap in &report.gaps {
            warn!(error = %gap.to_error(symbol), "unresolved data gap");
        }
        info!(
            %symbol,
            filled = report.filled,
            gap_minutes = report.gap_minutes(),
            "reconciliation complete"
        );

        report
    }

    async fn fetch_with_retry(
        &self,
        instrument: &Instrument,
        range: MinuteRange,
    ) -> Result<Vec<Candle>, GapReason> {
        let mut backoff = Backoff::new(self.config.base_backoff, self.config.max_backoff);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = tokio::time::timeout(
                self.config.fetch_timeout,
                self.fetcher
                    .fetch_intraday(instrument, range.start, range.end),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DataError::TransientNetwork(format!(
                    "historical fetch timed out after {:?}",
                    self.config.fetch_timeout
                )))
            });

            match result {
                Ok(candles) => return Ok(candles),
                Err(DataError::NotFound(_)) => return Err(GapReason::NotFound),
                Err(error) if error.is_retryable() && attempts < self.config.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        symbol = %instrument.symbol,
                        %range,
                        attempts,
                        ?delay,
                        %error,
                        "historical fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(GapReason::Failed { attempts, error }),
            }
        }
    }

    async fn persist(
        &self,
        instrument: &Instrument,
        range: MinuteRange,
        candles: Vec<Candle>,
        report: &mut ReconcileReport,
    ) {
        // Minutes either persisted or already recorded as a persistence gap
        let mut accounted = FnvHashSet::default();

        for mut candle in candles {
            candle.minute = minute_bucket(candle.minute);
            if !range.contains(candle.minute) || !candle.is_consistent() {
                debug!(symbol = %instrument.symbol, minute = %candle.minute, "discarding fetched candle");
                continue;
            }
            candle.symbol = instrument.symbol.clone();
            candle.date = self.session.local_date(candle.minute);

            let minute = candle.minute;
            if !accounted.insert(minute) {
                continue;
            }
            match self.gateway.upsert(candle).await {
                Ok(_) => report.filled += 1,
                Err(error) => report.gaps.push(DataGap {
                    range: MinuteRange {
                        start: minute,
                        end: minute + CANDLE_INTERVAL,
                    },
                    reason: GapReason::Persistence(error),
                }),
            }
        }

        report.gaps.extend(
            missing_ranges(range, &accounted)
                .into_iter()
                .map(|range| DataGap {
                    range,
                    reason: GapReason::NoData,
                }),
        );
    }
}

/// Contiguous runs of minutes in `window` that are not in `present`.
pub fn missing_ranges(window: MinuteRange, present: &FnvHashSet<DateTime<Utc>>) -> Vec<MinuteRange> {
    window
        .minutes()
        .chunk_by(|minute| present.contains(minute))
        .into_iter()
        .filter(|(is_present, _)| !is_present)
        .filter_map(|(_, mut minutes)| {
            let start = minutes.next()?;
            let last = minutes.last().unwrap_or(start);
            Some(MinuteRange {
                start,
                end: last + CANDLE_INTERVAL,
            })
        })
        .collect()
}
