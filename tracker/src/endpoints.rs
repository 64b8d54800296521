use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use time::format_description::well_known::Rfc3339;
use tokio::time::timeout;
use tracing::instrument;

use crate::api::{
    BulkEventResponse, DependencyStatus, EventResponse, HealthResponse, MetricBucket,
    MetricsResponse, ServiceHealth, TrackerError,
};
use crate::event::{BulkEventRequest, Event, MetricRequest};
use crate::router::AppState;

const DEPENDENCY_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn index() -> &'static str {
    "tracker"
}

#[instrument(skip_all)]
pub async fn post_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EventResponse>, TrackerError> {
    let event: Event = serde_json::from_slice(&body)
        .map_err(|err| TrackerError::RequestParsing(err.to_string()))?;
    event.validate(state.clock.now_unix(), state.timestamp_slack_seconds)?;

    let response = state.service.post_event(event).await?;
    Ok(Json(response))
}

#[instrument(skip_all)]
pub async fn post_events_bulk(State(state): State<AppState>, body: Bytes) -> Response {
    let request: BulkEventRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return bulk_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {err}"),
                0,
            )
        }
    };

    let total = request.events.len();
    if let Err(err) = request.validate(state.clock.now_unix(), state.timestamp_slack_seconds) {
        return bulk_response(StatusCode::BAD_REQUEST, err.to_string(), total);
    }

    match state.service.post_events_bulk(request.events).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => bulk_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {err}"),
            total,
        ),
    }
}

/// Non-200 bulk responses report the whole request as failed.
fn bulk_response(status: StatusCode, message: String, total: usize) -> Response {
    (
        status,
        Json(BulkEventResponse {
            success: false,
            message,
            total_count: total,
            success_count: 0,
            failure_count: total,
        }),
    )
        .into_response()
}

#[instrument(skip_all)]
pub async fn get_metrics(
    State(state): State<AppState>,
    Query(request): Query<MetricRequest>,
) -> Response {
    if let Err(err) = request.validate(state.clock.now_unix()) {
        return metrics_response(StatusCode::BAD_REQUEST, err.to_string(), vec![]);
    }

    match state.service.get_metrics(&request).await {
        Ok(metrics) => metrics_response(
            StatusCode::OK,
            "Metrics retrieved successfully".to_string(),
            metrics,
        ),
        Err(err) => metrics_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {err}"),
            vec![],
        ),
    }
}

fn metrics_response(status: StatusCode, message: String, metrics: Vec<MetricBucket>) -> Response {
    (
        status,
        Json(MetricsResponse {
            success: status == StatusCode::OK,
            message,
            metrics,
        }),
    )
        .into_response()
}

/// Active dependency check: pings the store and the cache under a short
/// deadline. Distinct from `/_liveness`, which watches the worker loop.
#[instrument(skip_all)]
pub async fn health(State(state): State<AppState>) -> Response {
    let (clickhouse, redis) = tokio::join!(
        dependency_status(timeout(DEPENDENCY_CHECK_TIMEOUT, state.store.ping())),
        dependency_status(timeout(DEPENDENCY_CHECK_TIMEOUT, state.cache.ping())),
    );

    let healthy = clickhouse.status == "healthy" && redis.status == "healthy";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp,
            services: ServiceHealth { clickhouse, redis },
        }),
    )
        .into_response()
}

async fn dependency_status<F, E>(check: F) -> DependencyStatus
where
    F: std::future::Future<Output = Result<Result<(), E>, tokio::time::error::Elapsed>>,
    E: std::fmt::Display,
{
    match check.await {
        Ok(Ok(())) => DependencyStatus {
            status: "healthy",
            message: None,
        },
        Ok(Err(err)) => DependencyStatus {
            status: "unhealthy",
            message: Some(err.to_string()),
        },
        Err(_) => DependencyStatus {
            status: "unhealthy",
            message: Some("health check timed out".to_string()),
        },
    }
}
