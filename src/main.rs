use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::delete, routing::get, routing::post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trackwave_api::alert_engine::AlertEngine;
use trackwave_api::batch_writer::BatchWriter;
use trackwave_api::broadcast::BroadcastHub;
use trackwave_api::broker_pool::BrokerPool;
use trackwave_api::config::TrackwaveConfig;
use trackwave_api::fingerprint::Fingerprint;
use trackwave_api::ingest::{IngestDeps, IngestPipeline};
use trackwave_api::location_cache::LocationCache;
use trackwave_api::metrics::Metrics;
use trackwave_api::models::alert::{Alert, AlertKind, AlertLevel};
use trackwave_api::models::vehicle::{VehicleDirectory, spawn_directory_refresh};
use trackwave_api::partition_manager::PartitionManager;
use trackwave_api::scheduler::{Scheduler, SchedulerDeps};
use trackwave_api::shutdown::ShutdownController;
use trackwave_api::store::Store;
use trackwave_api::{AppState, handlers, migrations};

/// Devices remembered by the dedup gate before LRU eviction kicks in.
const FINGERPRINT_DEVICES: usize = 50_000;
const FINGERPRINT_SKEW_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("trackwave_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("TRACKWAVE_CONFIG").unwrap_or_else(|_| "./trackwave.toml".to_string());
    let config = TrackwaveConfig::load(&config_path)?;

    let store = Store::connect(&config.database).await?;
    migrations::run(&store).await?;

    let shutdown = ShutdownController::new();
    let metrics = Metrics::new();
    let cache = Arc::new(LocationCache::new(config.cache.max_entries));
    let fingerprint = Arc::new(Fingerprint::new(FINGERPRINT_DEVICES, FINGERPRINT_SKEW_HOURS));

    let directory = Arc::new(VehicleDirectory::new());
    match store.load_vehicle_owners().await {
        Ok(map) => {
            tracing::info!("vehicle directory loaded: {} devices", map.len());
            directory.replace(map);
        }
        Err(e) => tracing::warn!("initial vehicle directory load failed: {e}"),
    }
    spawn_directory_refresh(
        directory.clone(),
        store.clone(),
        config.ingest.directory_refresh_secs,
        shutdown.subscribe(),
    );

    let hub = BroadcastHub::new(config.broadcast.clone(), metrics.clone());
    let alerts = AlertEngine::new(hub.clone(), config.broadcast.clone(), config.alert.clone());

    let partitions = Arc::new(PartitionManager::new(store.clone(), config.partition.clone()));
    match partitions.ensure_current_and_future().await {
        Ok(created) if !created.is_empty() => {
            tracing::info!("partitions created at startup: {}", created.join(", "));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("startup partition ensure failed: {e}"),
    }

    let (batch, batch_task) = BatchWriter::start(
        config.batch.clone(),
        store.clone(),
        partitions.clone(),
        alerts.clone(),
        metrics.clone(),
        shutdown.subscribe(),
    );

    let (ingest, ingest_tx) = IngestPipeline::start(
        &config.ingest,
        IngestDeps {
            directory: directory.clone(),
            fingerprint,
            batch: batch.clone(),
            cache: cache.clone(),
            hub: hub.clone(),
            alerts: alerts.clone(),
            store: store.clone(),
            metrics: metrics.clone(),
        },
    );

    let pool = BrokerPool::start(
        config.broker.clone(),
        config.pool.clone(),
        ingest_tx,
        shutdown.subscribe(),
    );
    {
        let cache = cache.clone();
        pool.spawn_monitor(move || cache.len(), shutdown.subscribe());
    }

    let scheduler = Scheduler::new(
        SchedulerDeps {
            partitions: partitions.clone(),
            hub: hub.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            batch: batch.clone(),
            metrics: metrics.clone(),
        },
        config.broadcast.sweep_interval_secs,
        config.partition.auto_cleanup,
    );
    scheduler.spawn(shutdown.subscribe());

    let state = AppState {
        config: config.clone(),
        store,
        partitions,
        cache,
        hub: hub.clone(),
        pool: pool.clone(),
        batch,
        metrics,
        scheduler,
        ingest: ingest.clone(),
        directory,
        alerts: alerts.clone(),
    };

    let app = Router::new()
        // Partition admin
        .route("/api/v1/partitions/list", get(handlers::partitions::list))
        .route("/api/v1/partitions/create", post(handlers::partitions::create))
        .route(
            "/api/v1/partitions/create-current",
            post(handlers::partitions::create_current),
        )
        .route(
            "/api/v1/partitions/create-future",
            post(handlers::partitions::create_future),
        )
        .route(
            "/api/v1/partitions/maintenance",
            post(handlers::partitions::maintenance),
        )
        .route("/api/v1/partitions/cleanup", post(handlers::partitions::cleanup))
        .route(
            "/api/v1/partitions/scheduler/config",
            get(handlers::partitions::scheduler_config),
        )
        .route(
            "/api/v1/partitions/scheduler/status",
            get(handlers::partitions::scheduler_status),
        )
        .route(
            "/api/v1/partitions/scheduler/trigger/{name}",
            post(handlers::partitions::scheduler_trigger),
        )
        .route("/api/v1/partitions/{name}", delete(handlers::partitions::delete))
        .route("/api/v1/partitions/{name}/info", get(handlers::partitions::info))
        .route("/api/v1/partitions/{name}/health", get(handlers::partitions::health))
        .route(
            "/api/v1/partitions/{name}/metrics",
            get(handlers::partitions::metrics),
        )
        .route(
            "/api/v1/partitions/{name}/optimize",
            post(handlers::partitions::optimize),
        )
        .route(
            "/api/v1/partitions/{name}/analyze",
            post(handlers::partitions::analyze),
        )
        // Vehicle data
        .route("/api/vehicle/history/{device_id}", get(handlers::vehicle::history))
        .route(
            "/api/vehicle/history/{device_id}/stream",
            get(handlers::vehicle::history_stream),
        )
        .route(
            "/api/vehicle/history/{device_id}/stats",
            get(handlers::vehicle::history_stats),
        )
        .route(
            "/api/vehicle/history/{device_id}/paginated",
            get(handlers::vehicle::history_paginated),
        )
        .route(
            "/api/vehicle/history/{device_id}/chunked",
            get(handlers::vehicle::history_chunked),
        )
        .route(
            "/api/vehicle/distance/{device_id}/stream",
            get(handlers::vehicle::distance_stream),
        )
        .route(
            "/api/vehicle/latest-location/{device_id}",
            get(handlers::vehicle::latest_location),
        )
        .route(
            "/api/vehicle/live-location/{device_id}",
            post(handlers::vehicle::live_location),
        )
        .route("/api/vehicle/gps/upsert", post(handlers::vehicle::gps_upsert))
        .route(
            "/api/vehicle/gps/batch-upsert",
            post(handlers::vehicle::gps_batch_upsert),
        )
        // Capacity / test surface
        .route("/api/test/capacity/{n}", get(handlers::capacity::capacity))
        .route("/api/test/stats", get(handlers::capacity::stats))
        .route("/api/test/scale-up/{target}", get(handlers::capacity::scale_up))
        .route("/api/test/health", get(handlers::capacity::health))
        // Push channel & liveness
        .route("/ws", get(handlers::ws::upgrade))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("trackwave-api listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::error!("ctrl-c handler failed, shutting down");
            }
            serve_shutdown.trigger();
        })
        .await?;

    // Ordered drain: broker sessions finish in-flight messages, ingest
    // workers empty their queues, the batch writer force-flushes, then the
    // push sessions close and the schedulers stop with the runtime.
    tracing::info!("shutdown: draining pipeline");
    let broker_ok = pool.drain(Duration::from_secs(5)).await;
    let ingest_ok = ingest.drain(Duration::from_secs(15)).await;
    let batch_ok = tokio::time::timeout(Duration::from_secs(10), batch_task)
        .await
        .is_ok();

    if !(broker_ok && ingest_ok && batch_ok) {
        tracing::error!(
            "shutdown incomplete (broker={broker_ok}, ingest={ingest_ok}, batch={batch_ok})"
        );
        alerts.raise_system(Alert::new(
            AlertLevel::Critical,
            AlertKind::ShutdownTimeout,
            format!(
                "shutdown drain timed out (broker={broker_ok}, ingest={ingest_ok}, batch={batch_ok})"
            ),
        ));
    }
    hub.close_all("server shutting down");
    tracing::info!("trackwave-api stopped");
    Ok(())
}
