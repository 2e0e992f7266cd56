use crate::{config::FeedConfig, error::DataError, instrument::InstrumentKey, tick::Tick};
use async_trait::async_trait;
use backoff::Backoff;
use fnv::{FnvHashMap, FnvHashSet};
use futures::{StreamExt, stream::BoxStream};
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use timeout::TimeoutStream;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Capped exponential backoff with jitter.
pub mod backoff;

/// Read-idle timeout stream wrapper.
pub mod timeout;

/// WebSocket [`FeedConnector`] implementation.
pub mod websocket;

/// An established live feed connection.
///
/// The connection is terminated by dropping it.
pub struct FeedConnection {
    pub control: Box<dyn FeedControl>,
    pub ticks: BoxStream<'static, Result<Tick, DataError>>,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection").finish_non_exhaustive()
    }
}

/// Establishes [`FeedConnection`]s to the live tick feed.
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<FeedConnection, DataError>;
}

/// Topic management half of a [`FeedConnection`].
#[async_trait]
pub trait FeedControl: Send {
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError>;
    async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError>;
}

/// Result of checking a tick sequence number against a [`SequenceTracker`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SequenceCheck {
    InOrder,
    /// Behind the highest sequence seen, but within tolerance and never seen before.
    Reordered,
    /// Ahead of the highest sequence seen by more than the tolerance, ticks were likely missed.
    Gap { expected: u64, received: u64 },
    Duplicate,
    /// Behind the highest sequence seen by more than the tolerance.
    Stale,
}

impl SequenceCheck {
    /// Determine if a tick with this result should reach its aggregator.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::InOrder | Self::Reordered | Self::Gap { .. })
    }
}

/// Per-instrument de-duplication and ordering check of feed sequence numbers.
#[derive(Clone, Debug)]
pub struct SequenceTracker {
    highest: Option<u64>,
    seen: FnvHashSet<u64>,
    order: VecDeque<u64>,
    window: usize,
    tolerance: u64,
}

impl SequenceTracker {
    pub fn new(window: usize, tolerance: u64) -> Self {
        Self {
            highest: None,
            seen: FnvHashSet::default(),
            order: VecDeque::with_capacity(window.min(1024)),
            window: window.max(1),
            tolerance,
        }
    }

    pub fn check(&mut self, sequence: u64) -> SequenceCheck {
        if self.seen.contains(&sequence) {
            return SequenceCheck::Duplicate;
        }

        let check = match self.highest {
            None => SequenceCheck::InOrder,
            Some(highest) if sequence > highest => {
                if sequence - highest > self.tolerance {
                    SequenceCheck::Gap {
                        expected: highest + 1,
                        received: sequence,
                    }
                } else {
                    SequenceCheck::InOrder
                }
            }
            Some(highest) if highest - sequence > self.tolerance => {
                return SequenceCheck::Stale;
            }
            Some(_) => SequenceCheck::Reordered,
        };

        self.remember(sequence);
        check
    }

    fn remember(&mut self, sequence: u64) {
        self.highest = Some(self.highest.map_or(sequence, |highest| highest.max(sequence)));
        self.seen.insert(sequence);
        self.order.push_back(sequence);
        while self.order.len() > self.window {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Point in time snapshot of [`TickStreamClient`] counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct FeedStatsSnapshot {
    pub dispatched: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub gaps: u64,
    pub unrouted: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
pub struct FeedStats {
    dispatched: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    gaps: AtomicU64,
    unrouted: AtomicU64,
    reconnects: AtomicU64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

enum FeedCommand {
    Subscribe {
        instrument: InstrumentKey,
        route: mpsc::UnboundedSender<Tick>,
        ack: oneshot::Sender<Result<(), DataError>>,
    },
    Unsubscribe {
        instrument: InstrumentKey,
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to the single multiplexed live feed connection.
///
/// A dispatcher task owns the connection, reconnects it with capped exponential backoff, and
/// routes every de-duplicated tick to the channel registered for its instrument.
#[derive(Clone, Debug)]
pub struct TickStreamClient {
    commands: mpsc::UnboundedSender<FeedCommand>,
    stats: Arc<FeedStats>,
}

impl TickStreamClient {
    /// Spawn the dispatcher task, returning a client handle and the task's [`JoinHandle`].
    pub fn spawn(connector: Arc<dyn FeedConnector>, config: FeedConfig) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(FeedStats::default());

        let dispatcher = Dispatcher {
            connector,
            config,
            routes: FnvHashMap::default(),
            commands: commands_rx,
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(dispatcher.run());

        (
            Self {
                commands: commands_tx,
                stats,
            },
            handle,
        )
    }

    /// Route ticks of `instrument` to `route`, subscribing the topic on the live connection.
    ///
    /// If the feed is currently disconnected the topic is recorded and subscribed as soon as
    /// the connection is re-established.
    pub async fn subscribe_instrument(
        &self,
        instrument: InstrumentKey,
        route: mpsc::UnboundedSender<Tick>,
    ) -> Result<(), DataError> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(FeedCommand::Subscribe {
                instrument,
                route,
                ack,
            })
            .map_err(|_| DataError::FeedTerminated)?;
        ack_rx.await.map_err(|_| DataError::FeedTerminated)?
    }

    /// Stop routing ticks of `instrument` and remove the topic from the live connection.
    ///
    /// Once this returns no further tick is sent to the route registered for `instrument`.
    pub async fn unsubscribe_instrument(&self, instrument: &InstrumentKey) -> Result<(), DataError> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(FeedCommand::Unsubscribe {
                instrument: instrument.clone(),
                ack,
            })
            .map_err(|_| DataError::FeedTerminated)?;
        ack_rx.await.map_err(|_| DataError::FeedTerminated)
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the connection and stop the dispatcher task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(FeedCommand::Shutdown);
    }
}

struct Route {
    tx: mpsc::UnboundedSender<Tick>,
    sequences: SequenceTracker,
}

/// Why the dispatcher left the connected state.
enum Disconnect {
    Dropped,
    Shutdown,
}

struct Dispatcher {
    connector: Arc<dyn FeedConnector>,
    config: FeedConfig,
    routes: FnvHashMap<InstrumentKey, Route>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    stats: Arc<FeedStats>,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);
        let mut connected_before = false;

        loop {
            let connector = Arc::clone(&self.connector);
            let Some(result) = self.serve_offline_until(connector.connect()).await else {
                break;
            };

            let disconnect = match result {
                Ok(connection) => {
                    if connected_before {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    connected_before = true;
                    info!(topics = self.routes.len(), "feed connected");
                    self.serve_connection(connection, &mut backoff).await
                }
                Err(error) => {
                    warn!(%error, "feed connection failed");
                    Disconnect::Dropped
                }
            };

            if let Disconnect::Shutdown = disconnect {
                break;
            }

            let delay = backoff.next_delay();
            warn!(?delay, attempt = backoff.attempt(), "feed disconnected, reconnecting after backoff");
            if self
                .serve_offline_until(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                break;
            }
        }

        info!("feed dispatcher stopped");
    }

    /// Serve commands without a connection until `future` resolves.
    ///
    /// Returns `None` if shutdown was requested first.
    async fn serve_offline_until<Fut>(&mut self, future: Fut) -> Option<Fut::Output>
    where
        Fut: Future,
    {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Some(output),
                command = self.commands.recv() => match command {
                    None | Some(FeedCommand::Shutdown) => return None,
                    Some(command) => self.handle_offline(command),
                },
            }
        }
    }

    fn handle_offline(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::Subscribe {
                instrument,
                route,
                ack,
            } => {
                debug!(%instrument, "feed offline, topic recorded for next connection");
                self.add_route(instrument, route);
                let _ = ack.send(Ok(()));
            }
            FeedCommand::Unsubscribe { instrument, ack } => {
                self.routes.remove(&instrument);
                let _ = ack.send(());
            }
            FeedCommand::Shutdown => {}
        }
    }

    async fn serve_connection(
        &mut self,
        connection: FeedConnection,
        backoff: &mut Backoff,
    ) -> Disconnect {
        let FeedConnection { mut control, ticks } = connection;

        // Every held topic is re-issued before any tick is read from the new connection
        let topics = self.routes.keys().cloned().collect::<Vec<_>>();
        if !topics.is_empty() {
            if let Err(error) = control.subscribe(&topics).await {
                warn!(%error, topics = topics.len(), "failed to re-issue feed subscriptions");
                return Disconnect::Dropped;
            }
            info!(topics = topics.len(), "re-issued feed subscriptions");
        }
        backoff.reset();

        let mut ticks = TimeoutStream::new(ticks, self.config.read_timeout);
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    None | Some(FeedCommand::Shutdown) => return Disconnect::Shutdown,
                    Some(command) => {
                        if let Err(error) = self.handle_online(command, control.as_mut()).await {
                            warn!(%error, "feed control failed, dropping connection");
                            return Disconnect::Dropped;
                        }
                    }
                },
                tick = ticks.next() => match tick {
                    Some(Ok(tick)) => self.dispatch(tick),
                    Some(Err(error)) if error.is_retryable() => {
                        warn!(%error, "feed stream error");
                        return Disconnect::Dropped;
                    }
                    Some(Err(error)) => {
                        warn!(%error, "skipping undecodable feed message");
                    }
                    None => {
                        warn!("feed stream ended");
                        return Disconnect::Dropped;
                    }
                },
            }
        }
    }

    async fn handle_online(
        &mut self,
        command: FeedCommand,
        control: &mut dyn FeedControl,
    ) -> Result<(), DataError> {
        match command {
            FeedCommand::Subscribe {
                instrument,
                route,
                ack,
            } => {
                let is_new = self.add_route(instrument.clone(), route);
                if !is_new {
                    let _ = ack.send(Ok(()));
                    return Ok(());
                }

                match control.subscribe(std::slice::from_ref(&instrument)).await {
                    Ok(()) => {
                        info!(%instrument, "subscribed feed topic");
                        let _ = ack.send(Ok(()));
                        Ok(())
                    }
                    Err(error) if error.is_retryable() => {
                        // Topic stays held and is re-issued on reconnect
                        let _ = ack.send(Ok(()));
                        Err(error)
                    }
                    Err(error) => {
                        self.routes.remove(&instrument);
                        let _ = ack.send(Err(error));
                        Ok(())
                    }
                }
            }
            FeedCommand::Unsubscribe { instrument, ack } => {
                let removed = self.routes.remove(&instrument).is_some();
                let _ = ack.send(());
                if removed {
                    control.unsubscribe(std::slice::from_ref(&instrument)).await?;
                    info!(%instrument, "unsubscribed feed topic");
                }
                Ok(())
            }
            FeedCommand::Shutdown => Ok(()),
        }
    }

    /// Register `route` for `instrument`, returning true if the topic was not already held.
    fn add_route(&mut self, instrument: InstrumentKey, route: mpsc::UnboundedSender<Tick>) -> bool {
        match self.routes.get_mut(&instrument) {
            Some(existing) => {
                existing.tx = route;
                false
            }
            None => {
                self.routes.insert(
                    instrument,
                    Route {
                        tx: route,
                        sequences: SequenceTracker::new(
                            self.config.dedup_window,
                            self.config.sequence_tolerance,
                        ),
                    },
                );
                true
            }
        }
    }

    fn dispatch(&mut self, tick: Tick) {
        let Some(route) = self.routes.get_mut(&tick.instrument) else {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(instrument = %tick.instrument, "dropping tick for unrouted instrument");
            return;
        };

        let check = route.sequences.check(tick.sequence);
        match check {
            SequenceCheck::Duplicate | SequenceCheck::Stale => {
                let counter = match check {
                    SequenceCheck::Duplicate => &self.stats.duplicates,
                    _ => &self.stats.stale,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                let error = DataError::DuplicateOrStaleTick {
                    instrument: tick.instrument,
                    sequence: tick.sequence,
                };
                debug!(%error, ?check, "dropping tick");
                return;
            }
            SequenceCheck::Gap { expected, received } => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                warn!(
                    instrument = %tick.instrument,
                    expected,
                    received,
                    "feed sequence gap, ticks may have been missed"
                );
            }
            SequenceCheck::InOrder | SequenceCheck::Reordered => {}
        }

        if route.tx.send(tick).is_err() {
            debug!("tick route closed, awaiting unsubscribe");
            return;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct FakeState {
        connects: AtomicUsize,
        subscribed: Mutex<Vec<(usize, Vec<InstrumentKey>)>>,
        unsubscribed: Mutex<Vec<InstrumentKey>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<Result<Tick, DataError>>>>,
    }

    struct FakeConnector(Arc<FakeState>);

    struct FakeControl {
        connection: usize,
        state: Arc<FakeState>,
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
                    state: Arc::clone(&self.0),
                }),
                ticks: UnboundedReceiverStream::new(rx).boxed(),
            })
        }
    }

    #[async_trait]
    impl FeedControl for FakeControl {
        async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
            self.state
                .subscribed
                .lock()
                .push((self.connection, instruments.to_vec()));
            Ok(())
        }

        async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), DataError> {
            self.state.unsubscribed.lock().extend_from_slice(instruments);
            Ok(())
        }
    }

    fn tick(instrument: &str, sequence: u64) -> Tick {
        Tick {
            instrument: InstrumentKey::new(instrument),
            time: Utc.with_ymd_and_hms(2024, 6, 3, 4, 30, 0).unwrap(),
            price: 100.0,
            quantity: 1,
            sequence,
        }
    }

    fn config() -> FeedConfig {
        FeedConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(100),
            ..FeedConfig::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_sequence_tracker() {
        struct TestCase {
            input: u64,
            expected: SequenceCheck,
        }

        // Window of 4, tolerance of 3
        let mut tracker = SequenceTracker::new(4, 3);

        let tests = vec![
            TestCase {
                // TC0: first sequence
                input: 10,
                expected: SequenceCheck::InOrder,
            },
            TestCase {
                // TC1: next sequence
                input: 11,
                expected: SequenceCheck::InOrder,
            },
            TestCase {
                // TC2: duplicate
                input: 11,
                expected: SequenceCheck::Duplicate,
            },
            TestCase {
                // TC3: small forward skip within tolerance
                input: 13,
                expected: SequenceCheck::InOrder,
            },
            TestCase {
                // TC4: skipped sequence arrives late
                input: 12,
                expected: SequenceCheck::Reordered,
            },
            TestCase {
                // TC5: forward jump beyond tolerance
                input: 20,
                expected: SequenceCheck::Gap {
                    expected: 14,
                    received: 20,
                },
            },
            TestCase {
                // TC6: far behind the highest sequence
                input: 14,
                expected: SequenceCheck::Stale,
            },
            TestCase {
                // TC7: within tolerance and unseen
                input: 18,
                expected: SequenceCheck::Reordered,
            },
            TestCase {
                // TC8: evicted from the window but now stale rather than duplicate
                input: 10,
                expected: SequenceCheck::Stale,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = tracker.check(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_dispatcher_drops_duplicates_and_preserves_order() {
        let state = Arc::new(FakeState::default());
        let (client, _handle) =
            TickStreamClient::spawn(Arc::new(FakeConnector(Arc::clone(&state))), config());

        let (route_tx, mut route_rx) = mpsc::unbounded_channel();
        client
            .subscribe_instrument(InstrumentKey::new("NSE_EQ|A"), route_tx)
            .await
            .unwrap();
        wait_until(|| !state.senders.lock().is_empty()).await;

        let feed = state.senders.lock()[0].clone();
        let sequences = [
            ("NSE_EQ|A", 1),
            ("NSE_EQ|A", 2),
            ("NSE_EQ|B", 1),
            ("NSE_EQ|A", 2),
            ("NSE_EQ|A", 3),
            ("NSE_EQ|A", 1),
        ];
        for (instrument, sequence) in sequences {
            feed.send(Ok(tick(instrument, sequence))).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(route_rx.recv().await.unwrap().sequence);
        }
        assert_eq!(received, vec![1, 2, 3]);

        wait_until(|| client.stats().duplicates == 2).await;
        let stats = client.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.unrouted, 1);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_dispatcher_resubscribes_after_reconnect() {
        let state = Arc::new(FakeState::default());
        let (client, handle) =
            TickStreamClient::spawn(Arc::new(FakeConnector(Arc::clone(&state))), config());

        wait_until(|| !state.senders.lock().is_empty()).await;

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        client
            .subscribe_instrument(InstrumentKey::new("NSE_EQ|A"), a_tx)
            .await
            .unwrap();
        client
            .subscribe_instrument(InstrumentKey::new("NSE_EQ|B"), b_tx)
            .await
            .unwrap();
        wait_until(|| state.subscribed.lock().len() == 2).await;

        // Drop the first connection
        state.senders.lock().remove(0);
        wait_until(|| state.connects.load(Ordering::SeqCst) == 2).await;
        wait_until(|| state.subscribed.lock().iter().any(|(connection, _)| *connection == 1)).await;

        let mut resubscribed = state
            .subscribed
            .lock()
            .iter()
            .filter(|(connection, _)| *connection == 1)
            .flat_map(|(_, topics)| topics.clone())
            .collect::<Vec<_>>();
        resubscribed.sort();
        assert_eq!(
            resubscribed,
            vec![InstrumentKey::new("NSE_EQ|A"), InstrumentKey::new("NSE_EQ|B")]
        );

        let feed = state.senders.lock()[0].clone();
        feed.send(Ok(tick("NSE_EQ|A", 7))).unwrap();
        assert_eq!(a_rx.recv().await.unwrap().sequence, 7);
        assert_eq!(client.stats().reconnects, 1);

        client.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_routing() {
        let state = Arc::new(FakeState::default());
        let (client, _handle) =
            TickStreamClient::spawn(Arc::new(FakeConnector(Arc::clone(&state))), config());

        let (route_tx, mut route_rx) = mpsc::unbounded_channel();
        let instrument = InstrumentKey::new("NSE_EQ|A");
        client
            .subscribe_instrument(instrument.clone(), route_tx)
            .await
            .unwrap();
        wait_until(|| !state.senders.lock().is_empty()).await;

        client.unsubscribe_instrument(&instrument).await.unwrap();
        wait_until(|| state.unsubscribed.lock().len() == 1).await;

        // Route sender was dropped by the dispatcher
        assert!(route_rx.recv().await.is_none());

        let feed = state.senders.lock()[0].clone();
        feed.send(Ok(tick("NSE_EQ|A", 1))).unwrap();
        wait_until(|| client.stats().unrouted == 1).await;
        client.shutdown();
    }
}
