use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::info;

use crate::api::MetricBucket;
use crate::event::{Event, MetricRequest};
use crate::store::{EventStore, StoreError};

/// Local-debug store: accepts writes and logs them, answers every metrics
/// query with an empty result. Never run this in production; the liveness
/// entry registered for it stays unhealthy on purpose.
#[derive(Default)]
pub struct PrintStore {}

#[async_trait]
impl EventStore for PrintStore {
    async fn write_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        histogram!("tracker_event_batch_size").record(events.len() as f64);
        counter!("tracker_events_written_total").increment(events.len() as u64);
        for event in events {
            info!("event: {event:?}");
        }
        Ok(())
    }

    async fn query_metrics(
        &self,
        request: &MetricRequest,
    ) -> Result<Vec<MetricBucket>, StoreError> {
        info!("metrics query: {request:?}");
        Ok(vec![])
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
