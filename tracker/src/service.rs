use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::api::{BulkEventResponse, EventResponse, MetricBucket, TrackerError};
use crate::batcher::{Batcher, BatcherError};
use crate::dedup::DedupCache;
use crate::event::{Event, MetricRequest};
use crate::store::EventStore;

/// Orchestrates the ingestion paths. Single events go through the dedup
/// check into the batcher; bulk requests skip the intake queue and write
/// synchronously, trading tail latency for per-request throughput.
pub struct EventService {
    cache: Arc<DedupCache>,
    store: Arc<dyn EventStore + Send + Sync>,
    batcher: Batcher,
}

impl EventService {
    pub fn new(
        cache: Arc<DedupCache>,
        store: Arc<dyn EventStore + Send + Sync>,
        batcher: Batcher,
    ) -> EventService {
        EventService {
            cache,
            store,
            batcher,
        }
    }

    /// Launches the batching worker. Idempotent.
    pub fn start(&self) {
        self.batcher.start();
    }

    pub async fn post_event(&self, event: Event) -> Result<EventResponse, TrackerError> {
        match self.cache.is_processed(&event).await {
            Ok(true) => {
                counter!("tracker_dedup_hits_total").increment(1);
                return Ok(EventResponse {
                    success: true,
                    message: "Event already processed".to_string(),
                });
            }
            Ok(false) => {}
            // a broken cache must not fail ingestion, accept the duplicate risk
            Err(err) => warn!("dedup lookup failed, accepting event: {err}"),
        }

        match self.batcher.enqueue(event) {
            Ok(()) => Ok(EventResponse {
                success: true,
                message: "Event posted successfully".to_string(),
            }),
            Err(BatcherError::BufferFull) => Err(TrackerError::BufferFull),
        }
    }

    /// Accepted events that turn out to be duplicates count as successes;
    /// the response reports all-or-nothing counts.
    pub async fn post_events_bulk(
        &self,
        events: Vec<Event>,
    ) -> Result<BulkEventResponse, TrackerError> {
        let total = events.len();
        let unprocessed = self.cache.filter_unprocessed(events).await;

        if unprocessed.is_empty() {
            debug!(total, "all events in bulk request were already processed");
        } else {
            self.store.write_batch(&unprocessed).await?;
            counter!("tracker_events_written_total").increment(unprocessed.len() as u64);

            let cache = self.cache.clone();
            tokio::spawn(async move {
                if let Err(err) = cache.mark_multiple_processed(&unprocessed).await {
                    warn!("failed to mark bulk events processed: {err}");
                }
            });
        }

        Ok(BulkEventResponse {
            success: true,
            message: "Bulk events posted successfully".to_string(),
            total_count: total,
            success_count: total,
            failure_count: 0,
        })
    }

    pub async fn get_metrics(
        &self,
        request: &MetricRequest,
    ) -> Result<Vec<MetricBucket>, TrackerError> {
        self.store
            .query_metrics(request)
            .await
            .map_err(|err| TrackerError::StoreQuery(err.to_string()))
    }

    /// Intake queue depth, for diagnostics.
    pub fn buffer_size(&self) -> usize {
        self.batcher.buffer_size()
    }

    /// Size of the batch under assembly, for diagnostics.
    pub fn batch_size(&self) -> usize {
        self.batcher.batch_size()
    }

    /// Drains the batcher. Must run before the process drops its store and
    /// cache clients.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}
