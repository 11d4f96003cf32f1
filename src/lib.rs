pub mod alert_engine;
pub mod batch_writer;
pub mod broadcast;
pub mod broker_pool;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod ingest;
pub mod location_cache;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod partition_manager;
pub mod scheduler;
pub mod shutdown;
pub mod store;

use std::sync::Arc;

use alert_engine::AlertEngine;
use batch_writer::BatchWriter;
use broadcast::BroadcastHub;
use broker_pool::BrokerPool;
use config::TrackwaveConfig;
use ingest::IngestPipeline;
use location_cache::LocationCache;
use metrics::Metrics;
use models::vehicle::VehicleDirectory;
use partition_manager::PartitionManager;
use scheduler::Scheduler;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: TrackwaveConfig,
    pub store: Store,
    pub partitions: Arc<PartitionManager>,
    pub cache: Arc<LocationCache>,
    pub hub: Arc<BroadcastHub>,
    pub pool: Arc<BrokerPool>,
    pub batch: BatchWriter,
    pub metrics: Arc<Metrics>,
    pub scheduler: Arc<Scheduler>,
    pub ingest: Arc<IngestPipeline>,
    pub directory: Arc<VehicleDirectory>,
    pub alerts: Arc<AlertEngine>,
}
