use async_trait::async_trait;
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::api::MetricBucket;
use crate::config::ClickHouseConfig;
use crate::event::{Event, MetricRequest};
use crate::store::{EventStore, StoreError};

const EVENTS_TABLE: &str = "events";

// ReplacingMergeTree collapses rows sharing the primary sort tuple at merge
// time, keeping the one with the highest ingested_at. Reads must use FINAL
// to observe the collapsed view before a merge has happened.
const CREATE_EVENTS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS events
    (
        event_name  LowCardinality(String),
        channel     LowCardinality(String),
        campaign_id String,
        user_id     String,
        timestamp   DateTime,
        tags        Array(String),
        metadata    String,
        ingested_at DateTime DEFAULT now()
    )
    ENGINE = ReplacingMergeTree(ingested_at)
    PARTITION BY toYYYYMMDD(timestamp)
    ORDER BY (timestamp, event_name, channel, user_id)
";

#[derive(Debug, Row, Serialize)]
struct EventRow {
    event_name: String,
    channel: String,
    campaign_id: String,
    user_id: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    timestamp: OffsetDateTime,
    tags: Vec<String>,
    metadata: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    ingested_at: OffsetDateTime,
}

#[derive(Debug, Row, Deserialize)]
struct MetricRow {
    bucket: String,
    total_events: u64,
    unique_users: u64,
}

pub struct ClickHouseStore {
    client: clickhouse::Client,
}

impl ClickHouseStore {
    pub fn new(config: &ClickHouseConfig) -> ClickHouseStore {
        let mut client = clickhouse::Client::default()
            .with_url(&config.clickhouse_url)
            .with_database(&config.clickhouse_database)
            .with_user(&config.clickhouse_user);

        if !config.clickhouse_password.is_empty() {
            client = client.with_password(&config.clickhouse_password);
        }

        if config.clickhouse_async_insert_enabled {
            client = client
                .with_option("async_insert", "1")
                .with_option(
                    "wait_for_async_insert",
                    config.clickhouse_async_insert_wait.to_string(),
                )
                .with_option(
                    "async_insert_max_data_size",
                    config.clickhouse_async_insert_max_data_size.to_string(),
                )
                .with_option(
                    "async_insert_busy_timeout_ms",
                    config.clickhouse_async_insert_busy_timeout_ms.to_string(),
                );
        }

        ClickHouseStore { client }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.client.query(CREATE_EVENTS_TABLE).execute().await?;
        info!("events table ready");
        Ok(())
    }
}

fn event_row(event: &Event, ingested_at: OffsetDateTime) -> Result<EventRow, StoreError> {
    // absent/empty metadata lands as the empty string, not "{}"
    let metadata = if event.metadata.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&event.metadata)?
    };

    let timestamp = OffsetDateTime::from_unix_timestamp(event.timestamp)
        .map_err(|_| StoreError::InvalidTimestamp(event.timestamp))?;

    Ok(EventRow {
        event_name: event.event_name.clone(),
        channel: event.channel.clone(),
        campaign_id: event.campaign_id.clone(),
        user_id: event.user_id.clone(),
        timestamp,
        tags: event.tags.clone(),
        metadata,
        ingested_at,
    })
}

/// Maps `group_by` to a safe bucket expression. Anything outside the closed
/// allowlist maps to `None`, which callers treat as "no grouping".
fn bucket_expr(group_by: &str) -> Option<&'static str> {
    match group_by {
        "hour" => Some("toString(toStartOfHour(timestamp))"),
        "day" => Some("toString(toStartOfDay(timestamp))"),
        "week" => Some("toString(toStartOfWeek(timestamp))"),
        "month" => Some("toString(toStartOfMonth(timestamp))"),
        "year" => Some("toString(toStartOfYear(timestamp))"),
        "channel" => Some("channel"),
        "campaign_id" => Some("campaign_id"),
        "user_id" => Some("user_id"),
        "event_name" => Some("event_name"),
        _ => None,
    }
}

/// Builds the aggregation statement. Only the allowlisted bucket expression
/// is ever inlined; every user-supplied value is left to parameter binding,
/// in the order event_name, from, to.
fn metrics_sql(request: &MetricRequest) -> String {
    let bucket = request.group_by.as_deref().and_then(bucket_expr);

    let mut sql = String::from("SELECT ");
    match bucket {
        Some(expr) => {
            sql.push_str(expr);
            sql.push_str(" AS bucket");
        }
        None => sql.push_str("'total' AS bucket"),
    }
    sql.push_str(", count() AS total_events, uniqExact(user_id) AS unique_users");
    // FINAL forces merge-time de-dup so unmerged duplicate rows do not
    // inflate the counts
    sql.push_str(" FROM events FINAL");

    let mut conditions = Vec::new();
    if request.event_name.is_some() {
        conditions.push("event_name = ?");
    }
    if request.from.is_some() {
        conditions.push("timestamp >= toDateTime(?)");
    }
    if request.to.is_some() {
        conditions.push("timestamp <= toDateTime(?)");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(expr) = bucket {
        sql.push_str(" GROUP BY ");
        sql.push_str(expr);
        sql.push_str(" ORDER BY bucket ASC");
    }
    sql
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn write_batch(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        // one wall-clock for the whole batch; the engine uses it as the
        // replacement tiebreaker
        let ingested_at = OffsetDateTime::now_utc();

        let mut insert = self.client.insert(EVENTS_TABLE)?;
        for event in events {
            insert.write(&event_row(event, ingested_at)?).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn query_metrics(
        &self,
        request: &MetricRequest,
    ) -> Result<Vec<MetricBucket>, StoreError> {
        let sql = metrics_sql(request);
        let mut query = self.client.query(&sql);

        if let Some(event_name) = &request.event_name {
            query = query.bind(event_name.as_str());
        }
        if let Some(from) = request.from {
            query = query.bind(from);
        }
        if let Some(to) = request.to {
            query = query.bind(to);
        }

        let rows = query.fetch_all::<MetricRow>().await?;
        Ok(rows
            .into_iter()
            .map(|row| MetricBucket {
                bucket: row.bucket,
                total_events: row.total_events,
                unique_users: row.unique_users,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }
}
