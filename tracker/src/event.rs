use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::TrackerError;

/// Maximum number of events accepted by a single bulk request.
pub const MAX_BULK_EVENTS: usize = 10_000;

/// A single behavioral observation. Immutable once constructed; validation
/// happens at the request boundary before anything downstream sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_name: String,
    pub channel: String,
    pub campaign_id: String,
    pub user_id: String,
    /// Seconds since epoch, client-reported.
    pub timestamp: i64,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    /// `(event_name, user_id, timestamp, channel)` serialized as an opaque
    /// dedup key. The `|` separator is reserved; upstream validation keeps
    /// these fields trusted.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.event_name, self.user_id, self.timestamp, self.channel
        )
    }

    pub fn validate(&self, now_unix: i64, slack_seconds: i64) -> Result<(), TrackerError> {
        if self.event_name.trim().is_empty() {
            return Err(invalid("event_name is required"));
        }
        if self.channel.trim().is_empty() {
            return Err(invalid("channel is required"));
        }
        if self.timestamp <= 0 {
            return Err(invalid("timestamp is required and must be a positive integer"));
        }
        if self.timestamp > now_unix + slack_seconds {
            return Err(invalid("timestamp cannot be in the future"));
        }
        if self.user_id.trim().is_empty() {
            return Err(invalid("user_id is required"));
        }
        if self.campaign_id.trim().is_empty() {
            return Err(invalid("campaign_id is required"));
        }
        // empty collections are fine, blank elements are not
        for tag in &self.tags {
            if tag.trim().is_empty() {
                return Err(invalid("tags cannot be empty"));
            }
        }
        for key in self.metadata.keys() {
            if key.trim().is_empty() {
                return Err(invalid("metadata keys cannot be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkEventRequest {
    pub events: Vec<Event>,
}

impl BulkEventRequest {
    /// All-or-nothing: any bad element fails the whole request.
    pub fn validate(&self, now_unix: i64, slack_seconds: i64) -> Result<(), TrackerError> {
        if self.events.is_empty() {
            return Err(invalid("events array cannot be empty"));
        }
        if self.events.len() > MAX_BULK_EVENTS {
            return Err(invalid("events array exceeds maximum allowed size"));
        }
        for (index, event) in self.events.iter().enumerate() {
            if let Err(err) = event.validate(now_unix, slack_seconds) {
                let message = match err {
                    TrackerError::InvalidRequest(message) => message,
                    other => other.to_string(),
                };
                return Err(invalid(&format!(
                    "validation failed for event at index {index}: {message}"
                )));
            }
        }
        Ok(())
    }
}

/// Filters for the metrics read path. Unknown fields (like the reserved
/// `aggregate` map) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricRequest {
    pub event_name: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub group_by: Option<String>,
}

impl MetricRequest {
    pub fn validate(&self, now_unix: i64) -> Result<(), TrackerError> {
        if let Some(from) = self.from {
            if from <= 0 {
                return Err(invalid("from must be a positive integer"));
            }
            if from > now_unix {
                return Err(invalid("from cannot be in the future"));
            }
        }
        if let Some(to) = self.to {
            if to <= 0 {
                return Err(invalid("to must be a positive integer"));
            }
            if to > now_unix {
                return Err(invalid("to cannot be in the future"));
            }
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(invalid("from cannot be greater than to"));
            }
        }
        if let Some(group_by) = &self.group_by {
            if group_by.trim().is_empty() {
                return Err(invalid("group_by cannot be empty if provided"));
            }
        }
        if let Some(event_name) = &self.event_name {
            if event_name.trim().is_empty() {
                return Err(invalid("event_name cannot be empty if provided"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> TrackerError {
    TrackerError::InvalidRequest(message.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use crate::test_utils::sample_event;

    use super::*;

    const NOW: i64 = 1_700_000_100;

    #[test]
    fn fingerprint_is_stable_and_ignores_payload() {
        let event = sample_event();
        assert_eq!(event.fingerprint(), "purchase|user_1|1700000000|web");
        assert_eq!(event.fingerprint(), event.fingerprint());

        // campaign_id, tags and metadata are not part of identity
        let mut other = sample_event();
        other.campaign_id = "black_friday".to_string();
        other.tags = vec![];
        other.metadata = HashMap::new();
        assert_eq!(event.fingerprint(), other.fingerprint());

        let mut different = sample_event();
        different.channel = "mobile".to_string();
        assert_ne!(event.fingerprint(), different.fingerprint());
    }

    #[test]
    fn validates_required_fields() {
        assert!(sample_event().validate(NOW, 0).is_ok());

        let mut event = sample_event();
        event.event_name = "  ".to_string();
        assert!(event.validate(NOW, 0).is_err());

        let mut event = sample_event();
        event.channel = String::new();
        assert!(event.validate(NOW, 0).is_err());

        let mut event = sample_event();
        event.user_id = String::new();
        assert!(event.validate(NOW, 0).is_err());

        let mut event = sample_event();
        event.campaign_id = String::new();
        assert!(event.validate(NOW, 0).is_err());
    }

    #[test]
    fn rejects_bad_timestamps() {
        let mut event = sample_event();
        event.timestamp = 0;
        assert!(event.validate(NOW, 0).is_err());

        let mut event = sample_event();
        event.timestamp = NOW + 1;
        assert!(event.validate(NOW, 0).is_err());

        // configurable slack tolerates client clock skew
        let mut event = sample_event();
        event.timestamp = NOW + 1;
        assert!(event.validate(NOW, 1).is_ok());
    }

    #[test]
    fn empty_collections_are_fine_blank_elements_are_not() {
        let mut event = sample_event();
        event.tags = vec![];
        event.metadata = HashMap::new();
        assert!(event.validate(NOW, 0).is_ok());

        let mut event = sample_event();
        event.tags = vec!["ok".to_string(), " ".to_string()];
        assert!(event.validate(NOW, 0).is_err());

        let mut event = sample_event();
        event.metadata = HashMap::from([(String::new(), json!("x"))]);
        assert!(event.validate(NOW, 0).is_err());
    }

    #[test]
    fn bulk_bounds() {
        let empty = BulkEventRequest { events: vec![] };
        assert!(empty.validate(NOW, 0).is_err());

        let oversized = BulkEventRequest {
            events: vec![sample_event(); MAX_BULK_EVENTS + 1],
        };
        assert!(oversized.validate(NOW, 0).is_err());

        let mut events = vec![sample_event(), sample_event()];
        events[1].user_id = String::new();
        let err = BulkEventRequest { events }
            .validate(NOW, 0)
            .expect_err("bad element must fail the batch");
        assert!(err.to_string().contains("index 1"));
    }

    #[test]
    fn metric_request_bounds() {
        let ok = MetricRequest {
            event_name: Some("purchase".to_string()),
            from: Some(NOW - 100),
            to: Some(NOW),
            group_by: Some("channel".to_string()),
        };
        assert!(ok.validate(NOW).is_ok());
        assert!(MetricRequest::default().validate(NOW).is_ok());

        let inverted = MetricRequest {
            from: Some(NOW),
            to: Some(NOW - 100),
            ..Default::default()
        };
        assert!(inverted.validate(NOW).is_err());

        let future = MetricRequest {
            from: Some(NOW + 10),
            ..Default::default()
        };
        assert!(future.validate(NOW).is_err());

        let blank_group = MetricRequest {
            group_by: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank_group.validate(NOW).is_err());
    }
}
