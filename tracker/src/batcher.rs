use std::sync::{Arc, Mutex};
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TrySendError, TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupCache;
use crate::event::Event;
use crate::prometheus::report_dropped_events;
use crate::store::EventStore;

/// Budget for one flush, independent of any request-scoped deadline.
const FLUSH_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatcherError {
    #[error("event buffer is full")]
    BufferFull,
}

#[derive(Clone)]
pub struct BatcherConfig {
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Absorbs producer spikes behind a bounded queue and coalesces events into
/// large store writes. A single background worker drains the queue; flushes
/// trigger on batch size or on a timer tick, whichever comes first.
///
/// Acceptance is best-effort: an enqueued event can still be lost if the
/// store write fails, there is no replay queue behind it.
pub struct Batcher {
    tx: mpsc::Sender<Event>,
    inner: Arc<Inner>,
    state: Mutex<WorkerState>,
}

struct WorkerState {
    running: bool,
    rx: Option<mpsc::Receiver<Event>>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    batch_size: usize,
    flush_interval: Duration,
    cache: Arc<DedupCache>,
    store: Arc<dyn EventStore + Send + Sync>,
    current: Mutex<Vec<Event>>,
    shutdown: CancellationToken,
    liveness: HealthHandle,
}

impl Batcher {
    pub fn new(
        config: BatcherConfig,
        cache: Arc<DedupCache>,
        store: Arc<dyn EventStore + Send + Sync>,
        liveness: HealthHandle,
    ) -> Batcher {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        Batcher {
            tx,
            inner: Arc::new(Inner {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                cache,
                store,
                current: Mutex::new(Vec::with_capacity(config.batch_size)),
                shutdown: CancellationToken::new(),
                liveness,
            }),
            state: Mutex::new(WorkerState {
                running: false,
                rx: Some(rx),
                handle: None,
            }),
        }
    }

    /// Launches the background worker. A second call is a no-op.
    pub fn start(&self) {
        let mut state = self.state.lock().expect("poisoned batcher state");
        if state.running {
            return;
        }
        let Some(rx) = state.rx.take() else {
            // stopped batchers stay stopped
            return;
        };
        state.running = true;

        let inner = self.inner.clone();
        state.handle = Some(tokio::spawn(async move { inner.run(rx).await }));
        info!("event batcher started");
    }

    /// Non-blocking. `BufferFull` must surface to callers as a retriable
    /// service-unavailable condition.
    pub fn enqueue(&self, event: Event) -> Result<(), BatcherError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                counter!("tracker_events_enqueued_total").increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(BatcherError::BufferFull),
            // racing a shutdown; tell the producer to retry later
            Err(TrySendError::Closed(_)) => Err(BatcherError::BufferFull),
        }
    }

    /// Events currently waiting in the intake queue.
    pub fn buffer_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Events accumulated in the batch under assembly.
    pub fn batch_size(&self) -> usize {
        self.inner.current.lock().expect("poisoned batch lock").len()
    }

    /// Flushes the current batch, drains the intake queue into a final one
    /// and waits for the worker to exit. Reentrant; later calls are no-ops.
    pub async fn shutdown(&self) {
        let handle = {
            let mut state = self.state.lock().expect("poisoned batcher state");
            if !state.running {
                return;
            }
            state.running = false;
            state.handle.take()
        };

        info!("event batcher draining");
        self.inner.shutdown.cancel();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("batcher worker panicked: {err}");
            }
        }
        info!("event batcher stopped");
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.drain(&mut rx).await;
                    return;
                }
                received = rx.recv() => match received {
                    Some(event) => {
                        let full = {
                            let mut current =
                                self.current.lock().expect("poisoned batch lock");
                            current.push(event);
                            current.len() >= self.batch_size
                        };
                        if full {
                            self.flush().await;
                        }
                    }
                    // every producer dropped its handle, nothing left to wait for
                    None => {
                        self.drain(&mut rx).await;
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.liveness.report_healthy();
                    let pending = {
                        !self.current.lock().expect("poisoned batch lock").is_empty()
                    };
                    if pending {
                        self.flush().await;
                    }
                }
            }
        }
    }

    /// Snapshots the current batch under the lock, then runs the dedup
    /// filter and the store write outside it. The write gets its own
    /// deadline so a request cancellation can never kill an in-flight flush.
    async fn flush(&self) {
        let batch = {
            let mut current = self.current.lock().expect("poisoned batch lock");
            std::mem::take(&mut *current)
        };
        if batch.is_empty() {
            return;
        }

        let intake = batch.len();
        let unprocessed = self.cache.filter_unprocessed(batch).await;
        if unprocessed.is_empty() {
            debug!(intake, "all events in batch were already processed");
            return;
        }

        let written = unprocessed.len();
        match tokio::time::timeout(FLUSH_DEADLINE, self.store.write_batch(&unprocessed)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                report_dropped_events("store_write_error", written as u64);
                error!(events = written, "failed to flush batch: {err}");
                return;
            }
            Err(_) => {
                report_dropped_events("flush_timeout", written as u64);
                error!(events = written, "flush timed out, dropping batch");
                return;
            }
        }

        counter!("tracker_events_written_total").increment(written as u64);
        histogram!("tracker_event_batch_size").record(written as f64);
        debug!(written, intake, "flushed batch");

        // mark-processed is fire-and-forget, a failure only costs duplicate
        // filtering work on a future batch
        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.mark_multiple_processed(&unprocessed).await {
                warn!("failed to mark events processed: {err}");
            }
        });
    }

    /// Shutdown path: flush what is assembled, pull whatever is left in the
    /// intake queue without blocking, flush that too.
    async fn drain(&self, rx: &mut mpsc::Receiver<Event>) {
        self.flush().await;

        let mut drained = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.current
                        .lock()
                        .expect("poisoned batch lock")
                        .push(event);
                    drained += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if drained > 0 {
            info!(drained, "drained intake queue during shutdown");
            self.flush().await;
        }
    }
}
