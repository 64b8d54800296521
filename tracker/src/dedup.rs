use std::collections::HashMap;
use std::sync::Arc;

use common_redis::{Client, CustomRedisError};
use metrics::counter;
use tracing::warn;

use crate::event::Event;

/// Namespace prefix keeping dedup entries away from other tenants of the
/// cache.
pub const EVENT_KEY_PREFIX: &str = "clickhouse_event:";

const PROCESSED_SENTINEL: &str = "1";

/// Idempotency filter over the shared cache. Entries expire after
/// `ttl_millis` (non-positive means never). Lookups that fail because the
/// backend is down are surfaced to callers, who are expected to fail OPEN:
/// accepting a duplicate beats dropping an event.
pub struct DedupCache {
    redis: Arc<dyn Client + Send + Sync>,
    ttl_millis: i64,
}

impl DedupCache {
    pub fn new(redis: Arc<dyn Client + Send + Sync>, ttl_millis: i64) -> DedupCache {
        DedupCache { redis, ttl_millis }
    }

    fn key(event: &Event) -> String {
        format!("{EVENT_KEY_PREFIX}{}", event.fingerprint())
    }

    fn ttl(&self) -> Option<u64> {
        (self.ttl_millis > 0).then_some(self.ttl_millis as u64)
    }

    /// True iff a prior `mark_processed` for the same fingerprint exists and
    /// has not expired. A missing entry is not an error.
    pub async fn is_processed(&self, event: &Event) -> Result<bool, CustomRedisError> {
        match self.redis.get(Self::key(event)).await {
            Ok(value) => Ok(value == PROCESSED_SENTINEL),
            Err(CustomRedisError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn mark_processed(&self, event: &Event) -> Result<(), CustomRedisError> {
        self.redis
            .set_px(Self::key(event), PROCESSED_SENTINEL.to_string(), self.ttl())
            .await
    }

    /// Single-round-trip batch lookup. Fingerprints absent from the returned
    /// mapping must be treated as unprocessed by callers.
    pub async fn are_processed(
        &self,
        events: &[Event],
    ) -> Result<HashMap<String, bool>, CustomRedisError> {
        let keys: Vec<String> = events.iter().map(Self::key).collect();
        let values = self.redis.mget(keys).await?;

        let mut processed = HashMap::with_capacity(events.len());
        for (event, value) in events.iter().zip(values) {
            processed.insert(
                event.fingerprint(),
                value.as_deref() == Some(PROCESSED_SENTINEL),
            );
        }
        Ok(processed)
    }

    /// Pipelined batch set.
    pub async fn mark_multiple_processed(&self, events: &[Event]) -> Result<(), CustomRedisError> {
        if events.is_empty() {
            return Ok(());
        }
        let items = events
            .iter()
            .map(|event| (Self::key(event), PROCESSED_SENTINEL.to_string()))
            .collect();
        self.redis.mset_px(items, self.ttl()).await
    }

    /// Drops already-processed events from the batch. Fails OPEN: when the
    /// cache cannot answer, every event is treated as unprocessed.
    pub async fn filter_unprocessed(&self, events: Vec<Event>) -> Vec<Event> {
        let processed = match self.are_processed(&events).await {
            Ok(processed) => processed,
            Err(err) => {
                warn!("dedup lookup failed, assuming all events unprocessed: {err}");
                return events;
            }
        };

        let before = events.len();
        let unprocessed: Vec<Event> = events
            .into_iter()
            .filter(|event| {
                !processed
                    .get(&event.fingerprint())
                    .copied()
                    .unwrap_or(false)
            })
            .collect();

        let duplicates = before - unprocessed.len();
        if duplicates > 0 {
            counter!("tracker_dedup_hits_total").increment(duplicates as u64);
        }
        unprocessed
    }

    pub async fn ping(&self) -> Result<(), CustomRedisError> {
        self.redis.ping().await
    }
}
