use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::RedisClient;
use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;
use tracing::info;

use crate::batcher::{Batcher, BatcherConfig};
use crate::config::Config;
use crate::dedup::DedupCache;
use crate::router::router;
use crate::service::EventService;
use crate::store::clickhouse::ClickHouseStore;
use crate::store::print::PrintStore;
use crate::store::EventStore;
use crate::time::SystemClock;

const WORKER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let redis = Arc::new(
        RedisClient::with_timeout(
            config.redis_url.clone(),
            Duration::from_millis(config.redis_response_timeout_ms),
        )
        .await
        .expect("failed to create redis client"),
    );
    let cache = Arc::new(DedupCache::new(redis, config.cache_duration_ms));

    let store: Arc<dyn EventStore + Send + Sync> = if config.print_store {
        // Print store is only for local debug; never let such a pod go ready
        liveness
            .register("print_store".to_string(), WORKER_LIVENESS_DEADLINE)
            .report_status(ComponentStatus::Unhealthy);
        Arc::new(PrintStore::default())
    } else {
        let store = ClickHouseStore::new(&config.clickhouse);
        store
            .init_schema()
            .await
            .expect("failed to initialize events table");
        Arc::new(store)
    };

    let worker_liveness = liveness.register("batcher".to_string(), WORKER_LIVENESS_DEADLINE);
    let batcher = Batcher::new(
        BatcherConfig {
            buffer_capacity: config.buffer_capacity,
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs(config.flush_interval_seconds),
        },
        cache.clone(),
        store.clone(),
        worker_liveness,
    );

    let service = Arc::new(EventService::new(cache.clone(), store.clone(), batcher));
    service.start();

    let app = router(
        SystemClock {},
        liveness,
        service.clone(),
        cache,
        store,
        config.export_prometheus,
        config.timestamp_slack_seconds,
    );

    info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    // the server stopped taking requests; drain the pipeline before the
    // process lets go of its clients
    service.shutdown().await;
}
