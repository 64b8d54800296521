use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkEventResponse {
    pub success: bool,
    pub message: String,
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

/// One aggregation row. `bucket` is either a group label ("web",
/// "2024-08-25 10:00:00") or the literal "total" when no grouping is asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub bucket: String,
    pub total_events: u64,
    pub unique_users: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub success: bool,
    pub message: String,
    pub metrics: Vec<MetricBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub clickhouse: DependencyStatus,
    pub redis: DependencyStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub services: ServiceHealth,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Invalid request body: {0}")]
    RequestParsing(String),

    #[error("Validation failed: {0}")]
    InvalidRequest(String),

    /// Intake queue overflow; clients are expected to retry with backoff.
    #[error("event buffer is full")]
    BufferFull,

    #[error("failed to write events: {0}")]
    StoreWrite(#[from] StoreError),

    #[error("failed to query metrics: {0}")]
    StoreQuery(String),
}

impl IntoResponse for TrackerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            TrackerError::RequestParsing(_) | TrackerError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            TrackerError::BufferFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable, please try again later".to_string(),
            ),
            TrackerError::StoreWrite(_) | TrackerError::StoreQuery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {self}"),
            ),
        };

        (
            status,
            Json(EventResponse {
                success: false,
                message,
            }),
        )
            .into_response()
    }
}
