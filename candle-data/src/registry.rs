use crate::{
    aggregator::CandleAggregator,
    config::{BigPlayerConfig, LateTickPolicy},
    error::DataError,
    feed::TickStreamClient,
    gateway::PersistenceGateway,
    instrument::{Instrument, InstrumentResolver, Symbol},
    reconcile::{GapReconciler, ReconcileReport},
    session::{Clock, MarketSession},
    worker::SymbolWorker,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

/// Lifecycle state of a symbol subscription.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SubscriptionState {
    /// Reconciling, live ticks are buffered.
    Pending,
    /// Reconciled, live ticks are being aggregated.
    Active,
    Closed,
}

#[derive(Clone, Debug)]
pub(crate) enum Phase {
    Pending,
    Active(Arc<ReconcileReport>),
    Closed,
}

impl Phase {
    fn state(&self) -> SubscriptionState {
        match self {
            Phase::Pending => SubscriptionState::Pending,
            Phase::Active(_) => SubscriptionState::Active,
            Phase::Closed => SubscriptionState::Closed,
        }
    }
}

/// Cheaply cloneable view of one symbol subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    instrument: Instrument,
    subscribed_at: DateTime<Utc>,
    phase: watch::Receiver<Phase>,
}

impl SubscriptionHandle {
    pub fn symbol(&self) -> &Symbol {
        &self.instrument.symbol
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn subscribed_at(&self) -> DateTime<Utc> {
        self.subscribed_at
    }

    pub fn state(&self) -> SubscriptionState {
        self.phase.borrow().state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Wait until the subscription is [`SubscriptionState::Active`], returning the report of
    /// the reconciliation that preceded it.
    ///
    /// Fails with [`DataError::SubscriptionClosed`] if the subscription closed first.
    pub async fn wait_active(&self) -> Result<Arc<ReconcileReport>, DataError> {
        let mut phase = self.phase.clone();
        let closed = || DataError::SubscriptionClosed(self.instrument.symbol.clone());

        let settled = phase
            .wait_for(|phase| !matches!(phase, Phase::Pending))
            .await
            .map_err(|_| closed())?;
        match &*settled {
            Phase::Active(report) => Ok(Arc::clone(report)),
            _ => Err(closed()),
        }
    }

    /// Wait until the subscription is [`SubscriptionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|phase| matches!(phase, Phase::Closed)).await;
    }
}

enum Slot {
    Live {
        handle: SubscriptionHandle,
        stop: watch::Sender<bool>,
        worker: JoinHandle<()>,
    },
    /// Teardown in progress, resolves to `true` once finished.
    Closing(watch::Receiver<bool>),
}

struct RegistryInner {
    resolver: Arc<dyn InstrumentResolver>,
    feed: TickStreamClient,
    gateway: PersistenceGateway,
    reconciler: GapReconciler,
    session: MarketSession,
    clock: Arc<dyn Clock>,
    big_player: BigPlayerConfig,
    late_policy: LateTickPolicy,
    slots: Mutex<FnvHashMap<Symbol, Slot>>,
    shutdown: AtomicBool,
}

/// Owner of every symbol subscription.
///
/// There is at most one non-closed subscription, and therefore one aggregator, per symbol.
/// All subscribe/unsubscribe decisions for a symbol are made under a single lock, while the
/// slow parts (reconciliation, teardown) run outside it in the symbol's worker task.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .field("shutdown", &self.inner.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl SubscriptionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<dyn InstrumentResolver>,
        feed: TickStreamClient,
        gateway: PersistenceGateway,
        reconciler: GapReconciler,
        session: MarketSession,
        clock: Arc<dyn Clock>,
        big_player: BigPlayerConfig,
        late_policy: LateTickPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                resolver,
                feed,
                gateway,
                reconciler,
                session,
                clock,
                big_player,
                late_policy,
                slots: Mutex::new(FnvHashMap::default()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe `symbol`, idempotently.
    ///
    /// If a non-closed subscription exists its handle is returned without side effects.
    /// Otherwise a [`SubscriptionState::Pending`] subscription is created and its worker
    /// spawned to reconcile and then go live. A subscribe racing an in-progress unsubscribe
    /// waits for the teardown and then creates a fresh subscription.
    pub async fn subscribe(&self, symbol: &Symbol) -> Result<SubscriptionHandle, DataError> {
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(DataError::SubscriptionClosed(symbol.clone()));
            }

            let mut closing = {
                let mut slots = self.inner.slots.lock();
                match slots.get(symbol) {
                    Some(Slot::Live { handle, .. })
                        if handle.state() != SubscriptionState::Closed =>
                    {
                        return Ok(handle.clone());
                    }
                    Some(Slot::Closing(done)) => done.clone(),
                    _ => {
                        let instrument = self.inner.resolver.resolve(symbol)?;
                        let (handle, slot) = self.inner.start(instrument);
                        slots.insert(symbol.clone(), slot);
                        return Ok(handle);
                    }
                }
            };

            let _ = closing.wait_for(|done| *done).await;
        }
    }

    /// Close the subscription of `symbol`.
    ///
    /// Returns once the feed stopped routing the symbol, buffered ticks were applied and the
    /// partial candle was flushed to the gateway. Returns `false` if there was no subscription
    /// to close.
    pub async fn unsubscribe(&self, symbol: &Symbol) -> bool {
        let teardown = {
            let mut slots = self.inner.slots.lock();
            match slots.remove(symbol) {
                Some(Slot::Live { stop, worker, .. }) => {
                    let (done_tx, done_rx) = watch::channel(false);
                    slots.insert(symbol.clone(), Slot::Closing(done_rx));
                    Ok((stop, worker, done_tx))
                }
                Some(Slot::Closing(done)) => {
                    slots.insert(symbol.clone(), Slot::Closing(done.clone()));
                    Err(Some(done))
                }
                None => Err(None),
            }
        };

        let (stop, worker, done) = match teardown {
            Ok(teardown) => teardown,
            Err(Some(mut closing)) => {
                let _ = closing.wait_for(|done| *done).await;
                return false;
            }
            Err(None) => return false,
        };

        info!(%symbol, "unsubscribing");
        stop.send_replace(true);
        if let Err(error) = worker.await {
            error!(%symbol, %error, "symbol worker failed");
        }

        {
            let mut slots = self.inner.slots.lock();
            if matches!(slots.get(symbol), Some(Slot::Closing(_))) {
                slots.remove(symbol);
            }
        }
        done.send_replace(true);
        true
    }

    /// Determine if `symbol` has a [`SubscriptionState::Active`] subscription.
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.get(symbol).is_some_and(|handle| handle.is_active())
    }

    /// Handle of the live subscription of `symbol`, if any.
    pub fn get(&self, symbol: &Symbol) -> Option<SubscriptionHandle> {
        match self.inner.slots.lock().get(symbol) {
            Some(Slot::Live { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Symbols with a live (pending or active) subscription.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols = self
            .inner
            .slots
            .lock()
            .iter()
            .filter_map(|(symbol, slot)| match slot {
                Slot::Live { handle, .. } if handle.state() != SubscriptionState::Closed => {
                    Some(symbol.clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.symbols().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new subscriptions and close every existing one.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        let symbols = self.inner.slots.lock().keys().cloned().collect::<Vec<_>>();
        info!(subscriptions = symbols.len(), "closing all subscriptions");
        join_all(symbols.iter().map(|symbol| self.unsubscribe(symbol))).await;
    }
}

impl RegistryInner {
    fn start(&self, instrument: Instrument) -> (SubscriptionHandle, Slot) {
        let subscribed_at = self.clock.now();
        let (phase_tx, phase_rx) = watch::channel(Phase::Pending);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = SubscriptionHandle {
            instrument: instrument.clone(),
            subscribed_at,
            phase: phase_rx,
        };

        let aggregator = CandleAggregator::new(
            instrument.symbol.clone(),
            self.session,
            self.big_player.threshold_for(&instrument.symbol),
            self.late_policy,
        );
        info!(
            symbol = %instrument.symbol,
            instrument = %instrument.key,
            %subscribed_at,
            threshold = self.big_player.threshold_for(&instrument.symbol),
            "subscription pending"
        );

        let worker = SymbolWorker {
            instrument,
            subscribed_at,
            aggregator,
            feed: self.feed.clone(),
            reconciler: self.reconciler.clone(),
            gateway: self.gateway.clone(),
            phase: phase_tx,
        };
        let worker = tokio::spawn(worker.run(stop_rx));

        let slot = Slot::Live {
            handle: handle.clone(),
            stop: stop_tx,
            worker,
        };
        (handle, slot)
    }
}
