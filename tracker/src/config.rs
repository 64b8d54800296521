use std::net::SocketAddr;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_store: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    pub redis_url: String,

    #[envconfig(default = "100")]
    pub redis_response_timeout_ms: u64,

    #[envconfig(nested = true)]
    pub clickhouse: ClickHouseConfig,

    /// How long a fingerprint stays in the dedup cache, in milliseconds.
    /// Zero or negative disables expiry.
    #[envconfig(default = "3600000")]
    pub cache_duration_ms: i64,

    /// Intake queue depth; overflow surfaces to clients as 503.
    #[envconfig(default = "50000")]
    pub buffer_capacity: usize,

    /// Number of events that triggers a flush before the interval elapses.
    #[envconfig(default = "5000")]
    pub batch_size: usize,

    #[envconfig(default = "1")]
    pub flush_interval_seconds: u64,

    // client clocks drift; 0 keeps the strict "no future timestamps" contract
    #[envconfig(default = "0")]
    pub timestamp_slack_seconds: i64,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

#[derive(Envconfig, Clone)]
pub struct ClickHouseConfig {
    #[envconfig(default = "http://127.0.0.1:8123")]
    pub clickhouse_url: String,

    #[envconfig(default = "default")]
    pub clickhouse_database: String,

    #[envconfig(default = "app")]
    pub clickhouse_user: String,

    #[envconfig(default = "")]
    pub clickhouse_password: String,

    // Server-side async insert settings, forwarded to every query on the
    // connection. See https://clickhouse.com/docs/en/optimize/asynchronous-inserts
    #[envconfig(default = "true")]
    pub clickhouse_async_insert_enabled: bool,

    #[envconfig(default = "1")]
    pub clickhouse_async_insert_wait: u8,

    #[envconfig(default = "10485760")]
    pub clickhouse_async_insert_max_data_size: u64,

    #[envconfig(default = "200")]
    pub clickhouse_async_insert_busy_timeout_ms: u64,
}
