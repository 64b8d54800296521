use async_trait::async_trait;
use thiserror::Error;

use crate::api::MetricBucket;
use crate::event::{Event, MetricRequest};

pub mod clickhouse;
pub mod memory;
pub mod print;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Writing an empty batch is a caller bug, not a store condition.
    #[error("no events to insert")]
    EmptyBatch,

    #[error("event timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("failed to serialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("clickhouse error: {0}")]
    Client(#[from] ::clickhouse::error::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The analytics store. One row per event; duplicate rows are collapsed by
/// the engine at merge time, so reads must ask for the de-duplicated view.
#[async_trait]
pub trait EventStore {
    /// Lands the whole batch in one write. All-or-nothing: on error no
    /// partial commit is claimed.
    async fn write_batch(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Aggregated counts and distinct-user tallies, bucketed per the
    /// request's `group_by`.
    async fn query_metrics(&self, request: &MetricRequest)
        -> Result<Vec<MetricBucket>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: EventStore + ?Sized + Send + Sync> EventStore for Box<T> {
    async fn write_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        (**self).write_batch(events).await
    }

    async fn query_metrics(
        &self,
        request: &MetricRequest,
    ) -> Result<Vec<MetricBucket>, StoreError> {
        (**self).query_metrics(request).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
