use crate::{
    candle::{Candle, CandleKey},
    config::PersistenceConfig,
    error::DataError,
    feed::backoff::Backoff,
    instrument::Symbol,
    session::Clock,
    store::CandleStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{StreamExt, future::ready, stream::BoxStream};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{Notify, broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{debug, error, info, warn};

/// Point in time snapshot of [`PersistenceGateway`] counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct GatewayStatsSnapshot {
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
    pub expired: u64,
    pub purged: u64,
}

#[derive(Debug, Default)]
struct GatewayStats {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    purged: AtomicU64,
}

/// Bounded FIFO of closed candles waiting for the writer task.
///
/// Entries stay in the queue while being written, so readers always see them either here or in
/// the store.
#[derive(Debug, Default)]
struct WriteQueue {
    entries: VecDeque<(u64, Candle)>,
    next_sequence: u64,
}

struct GatewayInner {
    store: Arc<dyn CandleStore>,
    config: PersistenceConfig,
    clock: Arc<dyn Clock>,
    queue: Mutex<WriteQueue>,
    pending: watch::Sender<usize>,
    wake: Notify,
    merge_lock: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<Candle>,
    stats: GatewayStats,
    shutdown: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Idempotent, retention aware front for a [`CandleStore`].
///
/// Every write is a read-merge-put under [`Candle::merge`] precedence, so replaying the same
/// candle (retries, duplicate backfills, late corrections) always converges on the same stored
/// state. Live candles go through a bounded write queue drained by a dedicated writer task.
#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("config", &self.inner.config)
            .field("queued", &self.queued())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PersistenceGateway {
    /// Construct a [`PersistenceGateway`] and spawn its writer task.
    pub fn spawn(
        store: Arc<dyn CandleStore>,
        config: PersistenceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.updates_capacity.max(1));
        let (pending, _) = watch::channel(0);

        let gateway = Self {
            inner: Arc::new(GatewayInner {
                store,
                config,
                clock,
                queue: Mutex::new(WriteQueue::default()),
                pending,
                wake: Notify::new(),
                merge_lock: tokio::sync::Mutex::new(()),
                updates,
                stats: GatewayStats::default(),
                shutdown: AtomicBool::new(false),
                writer: Mutex::new(None),
            }),
        };

        let writer = tokio::spawn(run_writer(Arc::clone(&gateway.inner)));
        *gateway.inner.writer.lock() = Some(writer);
        gateway
    }

    /// Queue a candle for persistence without waiting for the store.
    ///
    /// If the queue is full the oldest queued candle is dropped and the loss logged.
    pub fn enqueue(&self, candle: Candle) {
        if self.inner.is_expired(candle.minute) {
            self.inner.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %candle.symbol, minute = %candle.minute, "skipping expired candle");
            return;
        }
        self.inner.push(candle);
    }

    /// Merge a candle into the store, retrying transient failures.
    ///
    /// Returns the merged candle now stored, or `None` if the candle is outside the retention
    /// window and was skipped.
    pub async fn upsert(&self, candle: Candle) -> Result<Option<Candle>, DataError> {
        self.inner.write(&candle).await
    }

    /// Read the candle stored at `key`, including any queued version not yet written.
    pub async fn read(&self, key: &CandleKey) -> Result<Option<Candle>, DataError> {
        if self.inner.is_expired(key.minute) {
            return Ok(None);
        }

        // Snapshot the queue before the store, an entry is only removed once written
        let queued = self.inner.queued_where(|candle| candle.key() == *key);
        let stored = self.inner.store.get(key).await?;

        Ok(queued
            .iter()
            .fold(stored, |merged, candle| match merged {
                Some(existing) => Some(existing.merged(candle)),
                None => Some(candle.clone()),
            }))
    }

    /// Candles of `symbol` for trading `date` with minute in `range`, ordered by minute.
    ///
    /// Candles outside the retention window are never returned.
    pub async fn read_range(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, DataError> {
        let from = range.start.max(self.inner.retention_cutoff());
        if range.end <= from {
            return Ok(Vec::new());
        }

        let queued = self.inner.queued_where(|candle| {
            candle.symbol == *symbol && candle.minute >= from && candle.minute < range.end
        });
        let stored = self.inner.store.range(symbol, from, range.end).await?;

        let mut candles = BTreeMap::<DateTime<Utc>, Candle>::new();
        for candle in stored.into_iter().chain(queued) {
            if candle.date != date {
                continue;
            }
            match candles.get_mut(&candle.minute) {
                Some(existing) => existing.merge(&candle),
                None => {
                    candles.insert(candle.minute, candle);
                }
            }
        }

        Ok(candles.into_values().collect())
    }

    /// Delete every stored candle older than the retention window.
    pub async fn purge_expired(&self) -> Result<usize, DataError> {
        let cutoff = self.inner.retention_cutoff();
        let purged = self.inner.store.delete_before(cutoff).await?;
        self.inner
            .stats
            .purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        info!(%cutoff, purged, "purged expired candles");
        Ok(purged)
    }

    /// Stream of every candle persisted (closed or corrected) for `symbol` from now on.
    ///
    /// A consumer that falls more than `updates_capacity` candles behind skips the missed
    /// updates.
    pub fn live_updates(&self, symbol: Symbol) -> BoxStream<'static, Candle> {
        BroadcastStream::new(self.inner.updates.subscribe())
            .filter_map(move |update| {
                ready(match update {
                    Ok(candle) if candle.symbol == symbol => Some(candle),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(%symbol, skipped, "live update consumer lagged");
                        None
                    }
                })
            })
            .boxed()
    }

    /// Wait until every queued candle has been written (or dropped).
    pub async fn flush(&self) {
        let mut pending = self.inner.pending.subscribe();
        let _ = pending.wait_for(|queued| *queued == 0).await;
    }

    /// Drain the write queue and stop the writer task.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_one();

        let writer = self.inner.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(error) = writer.await {
                error!(%error, "candle writer task failed");
            }
        }
    }

    /// Number of candles waiting in the write queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        let stats = &self.inner.stats;
        GatewayStatsSnapshot {
            written: stats.written.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            expired: stats.expired.load(Ordering::Relaxed),
            purged: stats.purged.load(Ordering::Relaxed),
        }
    }

    /// Oldest minute still inside the retention window.
    pub fn retention_cutoff(&self) -> DateTime<Utc> {
        self.inner.retention_cutoff()
    }
}

impl GatewayInner {
    fn retention_cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - self.config.retention()
    }

    fn is_expired(&self, minute: DateTime<Utc>) -> bool {
        minute < self.retention_cutoff()
    }

    fn push(&self, candle: Candle) {
        let queued = {
            let mut queue = self.queue.lock();
            if queue.entries.len() >= self.config.write_queue_capacity {
                if let Some((_, dropped)) = queue.entries.pop_front() {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        symbol = %dropped.symbol,
                        minute = %dropped.minute,
                        capacity = self.config.write_queue_capacity,
                        "candle write queue full, dropping oldest queued candle"
                    );
                }
            }
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.entries.push_back((sequence, candle));
            queue.entries.len()
        };

        self.pending.send_replace(queued);
        self.wake.notify_one();
    }

    fn complete(&self, sequence: u64) {
        let queued = {
            let mut queue = self.queue.lock();
            queue.entries.retain(|(queued, _)| *queued != sequence);
            queue.entries.len()
        };
        self.pending.send_replace(queued);
    }

    fn queued_where<F>(&self, predicate: F) -> Vec<Candle>
    where
        F: Fn(&Candle) -> bool,
    {
        self.queue
            .lock()
            .entries
            .iter()
            .filter(|(_, candle)| predicate(candle))
            .map(|(_, candle)| candle.clone())
            .collect()
    }

    async fn write(&self, candle: &Candle) -> Result<Option<Candle>, DataError> {
        let mut backoff = Backoff::new(
            self.config.write_backoff,
            self.config.write_backoff.saturating_mul(16),
        );

        loop {
            match self.merge_and_put(candle).await {
                Ok(merged) => return Ok(merged),
                Err(error) if error.is_retryable() && backoff.attempt() < self.config.write_retries => {
                    let delay = backoff.next_delay();
                    warn!(
                        symbol = %candle.symbol,
                        minute = %candle.minute,
                        attempt = backoff.attempt(),
                        ?delay,
                        %error,
                        "candle write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(error);
                }
            }
        }
    }

    async fn merge_and_put(&self, candle: &Candle) -> Result<Option<Candle>, DataError> {
        if self.is_expired(candle.minute) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let merged = {
            let _guard = self.merge_lock.lock().await;
            let merged = match self.store.get(&candle.key()).await? {
                Some(existing) => existing.merged(candle),
                None => candle.clone(),
            };
            self.store.put(merged.clone()).await?;
            merged
        };

        self.stats.written.fetch_add(1, Ordering::Relaxed);
        debug!(symbol = %merged.symbol, minute = %merged.minute, source = ?merged.source, "candle persisted");
        let _ = self.updates.send(merged.clone());
        Ok(Some(merged))
    }
}

async fn run_writer(inner: Arc<GatewayInner>) {
    loop {
        let next = inner.queue.lock().entries.front().cloned();

        let Some((sequence, candle)) = next else {
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            inner.wake.notified().await;
            continue;
        };

        match inner.write(&candle).await {
            Ok(_) => inner.complete(sequence),
            Err(error) if error.is_retryable() && !inner.shutdown.load(Ordering::Acquire) => {
                error!(
                    symbol = %candle.symbol,
                    minute = %candle.minute,
                    %error,
                    "candle write retries exhausted, re-queueing"
                );
                inner.complete(sequence);
                inner.push(candle);
                tokio::time::sleep(inner.config.write_backoff.saturating_mul(16)).await;
            }
            Err(error) => {
                error!(
                    symbol = %candle.symbol,
                    minute = %candle.minute,
                    %error,
                    "candle write failed, dropping candle"
                );
                inner.complete(sequence);
            }
        }
    }

    debug!("candle writer stopped");
}
