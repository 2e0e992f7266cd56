use crate::{
    aggregator::{CandleAggregator, TickOutcome},
    candle::{CandleKey, CandleSource},
    error::DataError,
    feed::TickStreamClient,
    gateway::PersistenceGateway,
    instrument::Instrument,
    reconcile::GapReconciler,
    registry::Phase,
    tick::Tick,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Owning task of one subscribed symbol.
///
/// Lifecycle:
/// 1. Route the instrument's live ticks into a FIFO channel.
/// 2. Reconcile `[market open, subscribed_at)` while live ticks buffer in the channel.
/// 3. Apply buffered, then live, ticks to the [`CandleAggregator`] in arrival order.
/// 4. On stop: remove the route, drain what is left in the channel and flush the partial
///    candle.
pub(crate) struct SymbolWorker {
    pub(crate) instrument: Instrument,
    pub(crate) subscribed_at: DateTime<Utc>,
    pub(crate) aggregator: CandleAggregator,
    pub(crate) feed: TickStreamClient,
    pub(crate) reconciler: GapReconciler,
    pub(crate) gateway: PersistenceGateway,
    pub(crate) phase: watch::Sender<Phase>,
}

impl SymbolWorker {
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let symbol = self.instrument.symbol.clone();
        let (tx, mut ticks) = mpsc::unbounded_channel();

        if let Err(error) = self
            .feed
            .subscribe_instrument(self.instrument.key.clone(), tx)
            .await
        {
            error!(%symbol, %error, "failed to route live ticks, closing subscription");
            self.phase.send_replace(Phase::Closed);
            return;
        }

        let mut stopped = tokio::select! {
            report = self.reconciler.reconcile_subscription(&self.instrument, self.subscribed_at) => {
                info!(
                    %symbol,
                    filled = report.filled,
                    gaps = report.gaps.len(),
                    buffered = ticks.len(),
                    "subscription active"
                );
                self.phase.send_replace(Phase::Active(Arc::new(report)));
                false
            }
            _ = stop_requested(&mut stop) => true,
        };

        while !stopped {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => self.apply(tick).await,
                    None => {
                        warn!(%symbol, "live tick route closed by feed");
                        break;
                    }
                },
                _ = stop_requested(&mut stop) => stopped = true,
            }
        }

        // No tick is routed to this worker once the unsubscribe returns
        if stopped {
            if let Err(error) = self.feed.unsubscribe_instrument(&self.instrument.key).await {
                debug!(%symbol, %error, "feed already terminated on unsubscribe");
            }
        }
        let mut drained = 0_usize;
        while let Some(tick) = ticks.recv().await {
            self.apply(tick).await;
            drained += 1;
        }

        if let Some(partial) = self.aggregator.flush() {
            debug!(%symbol, minute = %partial.minute, "flushing partial candle");
            self.gateway.enqueue(partial);
        }
        self.phase.send_replace(Phase::Closed);
        info!(%symbol, drained, "subscription closed");
    }

    async fn apply(&mut self, tick: Tick) {
        if let Some(minute) = self.aggregator.first_minute(&tick) {
            self.resume_persisted(minute).await;
        }

        match self.aggregator.update(&tick) {
            TickOutcome::Opened {
                closed: Some(candle),
            } => {
                debug!(symbol = %candle.symbol, minute = %candle.minute, volume = candle.volume, "candle closed");
                self.gateway.enqueue(candle);
            }
            TickOutcome::Opened { closed: None } | TickOutcome::Updated => {}
            TickOutcome::Late { minute } => {
                if let Err(error) = self.correct(minute, &tick).await {
                    error!(
                        symbol = %self.instrument.symbol,
                        %minute,
                        sequence = tick.sequence,
                        %error,
                        "late tick correction lost"
                    );
                }
            }
            TickOutcome::Ignored(reason) => {
                debug!(
                    symbol = %self.instrument.symbol,
                    sequence = tick.sequence,
                    time = %tick.time,
                    ?reason,
                    "tick ignored"
                );
            }
        }
    }

    /// Continue the live candle of `minute`, if a previous subscription left one.
    ///
    /// Historical and merged candles already span the whole minute and are max-merged with the
    /// new live candle by the gateway instead.
    async fn resume_persisted(&mut self, minute: DateTime<Utc>) {
        let symbol = &self.instrument.symbol;
        match self.gateway.read(&CandleKey::new(symbol.clone(), minute)).await {
            Ok(Some(candle)) if candle.source == CandleSource::Live => {
                info!(%symbol, %minute, volume = candle.volume, "resuming persisted candle");
                self.aggregator.resume(candle);
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%symbol, %minute, %error, "failed to read persisted candle, minute may under-count volume");
            }
        }
    }

    /// Merge a late tick into the persisted candle of its minute and re-persist it.
    async fn correct(&self, minute: DateTime<Utc>, tick: &Tick) -> Result<(), DataError> {
        let symbol = &self.instrument.symbol;
        let stored = self
            .gateway
            .read(&CandleKey::new(symbol.clone(), minute))
            .await?;

        let corrected = self.aggregator.merge_late(stored, tick);
        match self.gateway.upsert(corrected).await? {
            Some(candle) => {
                info!(%symbol, %minute, close = candle.close, volume = candle.volume, "late tick corrected candle");
            }
            None => debug!(%symbol, %minute, "late tick outside retention window"),
        }
        Ok(())
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender means the registry is gone, which also stops the worker
    let _ = stop.wait_for(|stop| *stop).await;
}
