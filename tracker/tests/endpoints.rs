use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use assert_json_diff::assert_json_include;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::Router;
use common_redis::{CustomRedisError, MockRedisClient};
use health::HealthRegistry;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use tracker::batcher::{Batcher, BatcherConfig};
use tracker::dedup::{DedupCache, EVENT_KEY_PREFIX};
use tracker::event::Event;
use tracker::router::router;
use tracker::service::EventService;
use tracker::store::memory::MemoryStore;
use tracker::store::EventStore;
use tracker::test_utils::{event_on_channel, SAMPLE_TIMESTAMP};
use tracker::time::FixedClock;

const NOW: i64 = 1_700_000_100;

struct TestApp {
    app: Router,
    store: MemoryStore,
    redis: MockRedisClient,
    service: Arc<EventService>,
}

struct TestAppOptions {
    redis: MockRedisClient,
    buffer_capacity: usize,
    start_worker: bool,
}

impl Default for TestAppOptions {
    fn default() -> Self {
        TestAppOptions {
            redis: MockRedisClient::new(),
            buffer_capacity: 1000,
            start_worker: false,
        }
    }
}

fn test_app(options: TestAppOptions) -> TestApp {
    let store = MemoryStore::new();
    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("batcher".to_string(), Duration::from_secs(30));
    let cache = Arc::new(DedupCache::new(Arc::new(options.redis.clone()), 3_600_000));

    let batcher = Batcher::new(
        BatcherConfig {
            buffer_capacity: options.buffer_capacity,
            batch_size: 10_000,
            flush_interval: Duration::from_millis(50),
        },
        cache.clone(),
        Arc::new(store.clone()),
        liveness,
    );
    let service = Arc::new(EventService::new(
        cache.clone(),
        Arc::new(store.clone()),
        batcher,
    ));
    if options.start_worker {
        service.start();
    }

    let clock = FixedClock {
        now: time::OffsetDateTime::from_unix_timestamp(NOW).unwrap(),
    };
    let app = router(
        clock,
        registry,
        service.clone(),
        cache,
        Arc::new(store.clone()) as Arc<dyn EventStore + Send + Sync>,
        false,
        0,
    );

    TestApp {
        app,
        store,
        redis: options.redis,
        service,
    }
}

fn valid_event(user_id: &str) -> Value {
    json!({
        "event_name": "purchase",
        "channel": "web",
        "campaign_id": "summer_sale_2025",
        "user_id": user_id,
        "timestamp": SAMPLE_TIMESTAMP,
        "tags": [],
        "metadata": {}
    })
}

async fn post_json(app: &Router, uri: &str, body: Value) -> Result<(StatusCode, Value)> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))?,
        )
        .await?;
    read_response(response).await
}

async fn post_raw(app: &Router, uri: &str, body: &'static str) -> Result<(StatusCode, Value)> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body))?,
        )
        .await?;
    read_response(response).await
}

async fn get(app: &Router, uri: &str) -> Result<(StatusCode, Value)> {
    let response = app
        .clone()
        .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty())?)
        .await?;
    read_response(response).await
}

async fn read_response(response: axum::response::Response) -> Result<(StatusCode, Value)> {
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    Ok((status, value))
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check(), "condition not reached in time");
}

#[tokio::test]
async fn posting_a_valid_event_lands_it_in_the_store() -> Result<()> {
    let harness = test_app(TestAppOptions {
        start_worker: true,
        ..Default::default()
    });

    let (status, body) = post_json(&harness.app, "/events", valid_event("user_1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({"success": true, "message": "Event posted successfully"})
    );

    let store = harness.store.clone();
    wait_until(|| store.written().len() == 1).await;
    assert_eq!(harness.store.written()[0].user_id, "user_1");
    Ok(())
}

#[tokio::test]
async fn already_processed_event_short_circuits() -> Result<()> {
    let redis = MockRedisClient::new().with_entry(
        &format!("{EVENT_KEY_PREFIX}purchase|user_1|{SAMPLE_TIMESTAMP}|web"),
        "1",
    );
    let harness = test_app(TestAppOptions {
        redis,
        ..Default::default()
    });

    let (status, body) = post_json(&harness.app, "/events", valid_event("user_1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({"success": true, "message": "Event already processed"})
    );

    // nothing was enqueued
    assert_eq!(harness.service.buffer_size(), 0);
    assert_eq!(harness.service.batch_size(), 0);
    Ok(())
}

#[tokio::test]
async fn cache_outage_still_accepts_events() -> Result<()> {
    let redis = MockRedisClient::new().break_with(CustomRedisError::Timeout);
    let harness = test_app(TestAppOptions {
        redis,
        ..Default::default()
    });

    let (status, _) = post_json(&harness.app, "/events", valid_event("user_1")).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_json(&harness.app, "/events", valid_event("user_1")).await?;
    assert_eq!(status, StatusCode::OK);

    // both copies reached the intake queue
    assert_eq!(harness.service.buffer_size(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_bodies_are_rejected() -> Result<()> {
    let harness = test_app(TestAppOptions::default());

    let (status, body) = post_raw(&harness.app, "/events", "not json at all").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(actual: body, expected: json!({"success": false}));

    // a missing required field is a parse failure, not a validation one
    let (status, _) = post_json(
        &harness.app,
        "/events",
        json!({"event_name": "purchase", "channel": "web"}),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn future_timestamps_are_rejected() -> Result<()> {
    let harness = test_app(TestAppOptions::default());

    let mut event = valid_event("user_1");
    event["timestamp"] = json!(NOW + 10);
    let (status, body) = post_json(&harness.app, "/events", event).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": false,
            "message": "Validation failed: timestamp cannot be in the future"
        })
    );
    Ok(())
}

#[tokio::test]
async fn full_buffer_returns_service_unavailable() -> Result<()> {
    let harness = test_app(TestAppOptions {
        buffer_capacity: 1,
        ..Default::default()
    });

    let (status, _) = post_json(&harness.app, "/events", valid_event("user_1")).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(&harness.app, "/events", valid_event("user_2")).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": false,
            "message": "Service temporarily unavailable, please try again later"
        })
    );
    Ok(())
}

#[tokio::test]
async fn bulk_writes_synchronously_and_filters_duplicates() -> Result<()> {
    let redis = MockRedisClient::new().with_entry(
        &format!("{EVENT_KEY_PREFIX}purchase|user_2|{SAMPLE_TIMESTAMP}|web"),
        "1",
    );
    let harness = test_app(TestAppOptions {
        redis,
        ..Default::default()
    });

    let (status, body) = post_json(
        &harness.app,
        "/events/bulk",
        json!({"events": [valid_event("user_1"), valid_event("user_2"), valid_event("user_3")]}),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": true,
            "total_count": 3,
            "success_count": 3,
            "failure_count": 0
        })
    );

    // e2 never reaches the writer, and the write happened within the request
    let written = harness.store.written();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|event| event.user_id != "user_2"));

    // the fire-and-forget mark-seen lands shortly after
    let redis = harness.redis.clone();
    let key = format!("{EVENT_KEY_PREFIX}purchase|user_1|{SAMPLE_TIMESTAMP}|web");
    wait_until(move || redis.entry(&key).is_some()).await;
    Ok(())
}

#[tokio::test]
async fn bulk_validation_is_all_or_nothing() -> Result<()> {
    let harness = test_app(TestAppOptions::default());

    let (status, _) = post_json(&harness.app, "/events/bulk", json!({"events": []})).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad = valid_event("user_2");
    bad["user_id"] = json!("");
    let (status, body) = post_json(
        &harness.app,
        "/events/bulk",
        json!({"events": [valid_event("user_1"), bad]}),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": false,
            "total_count": 2,
            "success_count": 0,
            "failure_count": 2
        })
    );
    assert!(harness.store.written().is_empty());
    Ok(())
}

#[tokio::test]
async fn bulk_store_failure_reports_total_failure() -> Result<()> {
    let harness = test_app(TestAppOptions::default());
    harness.store.set_failing(true);

    let (status, body) = post_json(
        &harness.app,
        "/events/bulk",
        json!({"events": [valid_event("user_1"), valid_event("user_2")]}),
    )
    .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": false,
            "total_count": 2,
            "success_count": 0,
            "failure_count": 2
        })
    );
    Ok(())
}

async fn seed_purchase_events(store: &MemoryStore) {
    let events: Vec<Event> = vec![
        event_on_channel("user_1", "web"),
        event_on_channel("user_2", "web"),
        event_on_channel("user_3", "mobile"),
    ];
    store.write_batch(&events).await.unwrap();
}

#[tokio::test]
async fn metrics_without_grouping_return_a_single_total_bucket() -> Result<()> {
    let harness = test_app(TestAppOptions::default());
    seed_purchase_events(&harness.store).await;

    let (status, body) = get(&harness.app, "/metrics?event_name=purchase").await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": true,
            "message": "Metrics retrieved successfully",
            "metrics": [
                {"bucket": "total", "total_events": 3, "unique_users": 3}
            ]
        })
    );
    Ok(())
}

#[tokio::test]
async fn metrics_grouped_by_channel_are_ordered_ascending() -> Result<()> {
    let harness = test_app(TestAppOptions::default());
    seed_purchase_events(&harness.store).await;

    let (status, body) = get(
        &harness.app,
        "/metrics?event_name=purchase&group_by=channel",
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "metrics": [
                {"bucket": "mobile", "total_events": 1, "unique_users": 1},
                {"bucket": "web", "total_events": 2, "unique_users": 2}
            ]
        })
    );
    Ok(())
}

#[tokio::test]
async fn hostile_group_by_behaves_like_no_grouping() -> Result<()> {
    let harness = test_app(TestAppOptions::default());
    seed_purchase_events(&harness.store).await;

    let (status, body) = get(
        &harness.app,
        "/metrics?group_by=%3BDROP%20TABLE%20events",
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "metrics": [
                {"bucket": "total", "total_events": 3, "unique_users": 3}
            ]
        })
    );
    Ok(())
}

#[tokio::test]
async fn metrics_time_range_is_validated() -> Result<()> {
    let harness = test_app(TestAppOptions::default());

    let (status, body) = get(
        &harness.app,
        &format!("/metrics?from={}&to={}", NOW, NOW - 100),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": false,
            "message": "Validation failed: from cannot be greater than to"
        })
    );
    Ok(())
}

#[tokio::test]
async fn health_reports_per_dependency_status() -> Result<()> {
    let harness = test_app(TestAppOptions::default());

    let (status, body) = get(&harness.app, "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "status": "healthy",
            "services": {
                "clickhouse": {"status": "healthy"},
                "redis": {"status": "healthy"}
            }
        })
    );
    Ok(())
}

#[tokio::test]
async fn health_goes_unhealthy_when_the_cache_is_down() -> Result<()> {
    let redis = MockRedisClient::new().break_with(CustomRedisError::Other("boom".to_string()));
    let harness = test_app(TestAppOptions {
        redis,
        ..Default::default()
    });

    let (status, body) = get(&harness.app, "/health").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_json_include!(
        actual: body,
        expected: json!({
            "status": "unhealthy",
            "services": {
                "clickhouse": {"status": "healthy"},
                "redis": {"status": "unhealthy"}
            }
        })
    );
    Ok(())
}

#[tokio::test]
async fn liveness_goes_green_once_the_worker_ticks() -> Result<()> {
    let harness = test_app(TestAppOptions {
        start_worker: true,
        ..Default::default()
    });

    // the worker reports on its flush ticks (50ms here)
    for _ in 0..100 {
        let (status, _) = get(&harness.app, "/_liveness").await?;
        if status == StatusCode::OK {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("liveness never went green");
}

#[tokio::test]
async fn graceful_shutdown_drains_accepted_events() -> Result<()> {
    let harness = test_app(TestAppOptions {
        start_worker: true,
        ..Default::default()
    });

    for i in 0..50 {
        let (status, _) =
            post_json(&harness.app, "/events", valid_event(&format!("user_{i}"))).await?;
        assert_eq!(status, StatusCode::OK);
    }

    harness.service.shutdown().await;
    assert_eq!(harness.store.written().len(), 50);
    Ok(())
}
