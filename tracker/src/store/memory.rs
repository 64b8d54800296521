use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::MetricBucket;
use crate::event::{Event, MetricRequest};
use crate::store::{EventStore, StoreError};

/// In-memory store for tests: records every written batch, answers metrics
/// queries with a naive aggregation over what was written, and can be
/// switched into a failing mode to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<Vec<Vec<Event>>>>,
    write_attempts: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// When true, writes and pings fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().expect("poisoned store lock").clone()
    }

    /// All written events, flattened in write order.
    pub fn written(&self) -> Vec<Event> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn matches(event: &Event, request: &MetricRequest) -> bool {
        if let Some(event_name) = &request.event_name {
            if &event.event_name != event_name {
                return false;
            }
        }
        if let Some(from) = request.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = request.to {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }

    // Column buckets only; time-window grouping needs the real store.
    fn bucket_label(event: &Event, group_by: &str) -> Option<String> {
        match group_by {
            "channel" => Some(event.channel.clone()),
            "campaign_id" => Some(event.campaign_id.clone()),
            "user_id" => Some(event.user_id.clone()),
            "event_name" => Some(event.event_name.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn write_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.batches
            .lock()
            .expect("poisoned store lock")
            .push(events.to_vec());
        Ok(())
    }

    async fn query_metrics(
        &self,
        request: &MetricRequest,
    ) -> Result<Vec<MetricBucket>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected query failure".to_string()));
        }

        let written = self.written();
        let selected: Vec<&Event> = written
            .iter()
            .filter(|event| Self::matches(event, request))
            .collect();

        // de-dup by fingerprint, mirroring the engine's replacing semantics
        let mut seen = HashSet::new();
        let selected: Vec<&Event> = selected
            .into_iter()
            .filter(|event| seen.insert(event.fingerprint()))
            .collect();

        let grouped = request
            .group_by
            .as_deref()
            .map(|group_by| {
                selected
                    .iter()
                    .any(|event| Self::bucket_label(event, group_by).is_some())
                    .then_some(group_by)
            })
            .unwrap_or(None);

        let mut buckets: BTreeMap<String, (u64, HashSet<&str>)> = BTreeMap::new();
        for event in &selected {
            let label = match grouped {
                Some(group_by) => match Self::bucket_label(event, group_by) {
                    Some(label) => label,
                    None => continue,
                },
                None => "total".to_string(),
            };
            let entry = buckets.entry(label).or_default();
            entry.0 += 1;
            entry.1.insert(event.user_id.as_str());
        }

        if buckets.is_empty() {
            buckets.insert("total".to_string(), (0, HashSet::new()));
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket, (total_events, users))| MetricBucket {
                bucket,
                total_events,
                unique_users: users.len() as u64,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected ping failure".to_string()));
        }
        Ok(())
    }
}
