use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use crate::dedup::DedupCache;
use crate::endpoints;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::service::EventService;
use crate::store::EventStore;
use crate::time::Clock;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EventService>,
    pub cache: Arc<DedupCache>,
    pub store: Arc<dyn EventStore + Send + Sync>,
    pub clock: Arc<dyn Clock + Send + Sync>,
    pub timestamp_slack_seconds: i64,
}

#[allow(clippy::too_many_arguments)]
pub fn router<C: Clock + Send + Sync + 'static>(
    clock: C,
    liveness: HealthRegistry,
    service: Arc<EventService>,
    cache: Arc<DedupCache>,
    store: Arc<dyn EventStore + Send + Sync>,
    metrics: bool,
    timestamp_slack_seconds: i64,
) -> Router {
    let state = AppState {
        service,
        cache,
        store,
        clock: Arc::new(clock),
        timestamp_slack_seconds,
    };

    let router = Router::new()
        .route("/", get(endpoints::index))
        .route("/events", post(endpoints::post_event))
        .route("/events/bulk", post(endpoints::post_events_bulk))
        .route("/metrics", get(endpoints::get_metrics))
        .route("/health", get(endpoints::health))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install the recorder unless asked to: a global recorder does not
    // play well with the router being built repeatedly in tests.
    // The analytics query endpoint owns /metrics, so the exporter lives
    // under /_metrics.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/_metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
