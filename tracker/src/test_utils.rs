//! Shared event builders for unit and integration tests.

use std::collections::HashMap;

use serde_json::json;

use crate::event::Event;

pub const SAMPLE_TIMESTAMP: i64 = 1_700_000_000;

pub fn sample_event() -> Event {
    Event {
        event_name: "purchase".to_string(),
        channel: "web".to_string(),
        campaign_id: "summer_sale_2025".to_string(),
        user_id: "user_1".to_string(),
        timestamp: SAMPLE_TIMESTAMP,
        tags: vec!["mobile".to_string(), "premium".to_string()],
        metadata: HashMap::from([("price".to_string(), json!(129.99))]),
    }
}

pub fn event_for_user(user_id: &str) -> Event {
    Event {
        user_id: user_id.to_string(),
        ..sample_event()
    }
}

pub fn event_on_channel(user_id: &str, channel: &str) -> Event {
    Event {
        user_id: user_id.to_string(),
        channel: channel.to_string(),
        ..sample_event()
    }
}
