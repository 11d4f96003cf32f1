use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alert_engine::AlertEngine;
use crate::batch_writer::BatchWriter;
use crate::broadcast::BroadcastHub;
use crate::config::IngestConfig;
use crate::fingerprint::Fingerprint;
use crate::location_cache::LocationCache;
use crate::metrics::Metrics;
use crate::models::sample::{parse_payload, sniff_device_id};
use crate::models::vehicle::VehicleDirectory;
use crate::store::Store;

/// One raw broker publish, unparsed.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// Everything a worker needs to push one sample through the pipeline.
#[derive(Clone)]
pub struct IngestDeps {
    pub directory: Arc<VehicleDirectory>,
    pub fingerprint: Arc<Fingerprint>,
    pub batch: BatchWriter,
    pub cache: Arc<LocationCache>,
    pub hub: Arc<BroadcastHub>,
    pub alerts: Arc<AlertEngine>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
}

/// Parse, enrich, dedup-gate, then fan out to persistence, cache and
/// broadcast.
///
/// Work is sharded over a fixed pool of workers by `hash(device_id) % W`.
/// The device id comes from a cheap key scan over the raw payload so the
/// CPU-bound full parse stays on the workers; a payload that names no
/// device falls back to its topic as the shard key. One device therefore
/// always lands on one worker, and per-device ordering survives from the
/// broker all the way into the batch queue.
pub struct IngestPipeline {
    tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl IngestPipeline {
    /// Returns the pipeline handle plus the sender the broker pool feeds.
    pub fn start(cfg: &IngestConfig, deps: IngestDeps) -> (Arc<Self>, mpsc::Sender<InboundMessage>) {
        let workers = cfg.effective_workers();
        let queue = cfg.per_device_queue.max(16);

        let mut worker_txs = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel::<InboundMessage>(queue);
            worker_txs.push(tx);
            let deps = deps.clone();
            tasks.push(tokio::spawn(worker_loop(id, rx, deps)));
        }

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(workers * queue);
        tasks.push(tokio::spawn(async move {
            // Ends when the last sender (broker sessions + API handle) drops.
            while let Some(msg) = inbound_rx.recv().await {
                let key = sniff_device_id(&msg.payload).unwrap_or(&msg.topic);
                let shard = shard_for(key, worker_txs.len());
                if worker_txs[shard].send(msg).await.is_err() {
                    break;
                }
            }
            tracing::debug!("ingest dispatcher stopped");
        }));

        tracing::info!("ingest pipeline started with {workers} workers");
        let pipeline = Arc::new(Self {
            tx: Mutex::new(Some(inbound_tx.clone())),
            tasks: Mutex::new(tasks),
            workers,
        });
        (pipeline, inbound_tx)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Feed a payload in through the same path broker messages take. Used
    /// by the HTTP injection endpoints.
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let tx = self.tx.lock().expect("ingest tx lock").clone();
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Stop accepting, then wait for the workers to finish what is queued.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.tx.lock().expect("ingest tx lock").take();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("ingest tasks lock"));
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        tokio::time::timeout(deadline, join_all).await.is_ok()
    }
}

/// Stable shard assignment over the device id (or the topic, for payloads
/// with no readable device).
pub fn shard_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

async fn worker_loop(id: usize, mut rx: mpsc::Receiver<InboundMessage>, deps: IngestDeps) {
    while let Some(msg) = rx.recv().await {
        process_message(&deps, msg).await;
    }
    tracing::debug!("ingest worker {id} stopped");
}

async fn process_message(deps: &IngestDeps, msg: InboundMessage) {
    let parsed = match parse_payload(&msg.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            Metrics::incr(&deps.metrics.messages_rejected);
            tracing::debug!("rejected payload on {}: {e}", msg.topic);
            return;
        }
    };
    if parsed.skipped > 0 {
        Metrics::add(&deps.metrics.messages_rejected, parsed.skipped as u64);
    }

    for mut sample in parsed.samples {
        Metrics::incr(&deps.metrics.messages_received);

        // Owner enrichment; a directory miss still persists and reaches the
        // generic topics, it just never hits a role-scoped one.
        let enriched = match deps.directory.lookup(&sample.device_id) {
            Some(owners) => {
                sample.owners = owners;
                true
            }
            None => {
                tracing::debug!("no vehicle registered for device {}", sample.device_id);
                false
            }
        };

        if !deps.fingerprint.accept(
            &sample.device_id,
            sample.recorded_at,
            sample.sequence_no.as_deref(),
        ) {
            Metrics::incr(&deps.metrics.dedup_rejected);
            continue;
        }

        // Last-location first so a live (N1) report is visible to lookups
        // before the history batch lands.
        if deps.cache.update(&sample) {
            if let Err(e) = deps.store.upsert_last_location(&sample).await {
                tracing::warn!("last-location write-through failed for {}: {e}", sample.device_id);
            }
        }

        deps.batch.submit(sample.clone()).await;
        deps.hub.publish_sample(&sample, enriched);
        deps.alerts.evaluate(&sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, BatchConfig, BroadcastConfig, TrackwaveConfig};
    use crate::models::sample::OwnerRefs;
    use crate::partition_manager::PartitionManager;
    use std::collections::HashMap;

    /// Store against a dead endpoint: the write-through path fails fast
    /// and the rest of the pipeline carries on, which is exactly the
    /// degradation contract.
    fn dead_store() -> Store {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://127.0.0.1:1/unused")
            .expect("lazy pool");
        Store::from_pool(pool)
    }

    // The controller is handed back so the test keeps it alive; dropping
    // it reads as shutdown to every subscribed task.
    fn test_deps(
        owners_by_device: HashMap<String, OwnerRefs>,
    ) -> (IngestDeps, crate::shutdown::ShutdownController) {
        let cfg = TrackwaveConfig::default();
        let metrics = Metrics::new();
        let hub = BroadcastHub::new(
            BroadcastConfig {
                rate_limit_ms: 0,
                ..cfg.broadcast.clone()
            },
            metrics.clone(),
        );
        let alerts = crate::alert_engine::AlertEngine::new(
            hub.clone(),
            cfg.broadcast.clone(),
            AlertConfig::default(),
        );
        let store = dead_store();
        let partitions = Arc::new(PartitionManager::new(store.clone(), cfg.partition.clone()));
        let shutdown = crate::shutdown::ShutdownController::new();
        let (batch, _task) = BatchWriter::start(
            BatchConfig {
                // Keep the flusher asleep for the test's lifetime.
                interval_ms: 60_000,
                ..cfg.batch
            },
            store.clone(),
            partitions,
            alerts.clone(),
            metrics.clone(),
            shutdown.subscribe(),
        );
        let directory = Arc::new(VehicleDirectory::new());
        directory.replace(owners_by_device);

        let deps = IngestDeps {
            directory,
            fingerprint: Arc::new(Fingerprint::new(1000, 24)),
            batch,
            cache: Arc::new(LocationCache::new(1000)),
            hub,
            alerts,
            store,
            metrics,
        };
        (deps, shutdown)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline did not settle in time");
    }

    fn drain_count(rx: &mut mpsc::UnboundedReceiver<String>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn duplicate_payload_persists_and_broadcasts_once() {
        let (deps, _shutdown) = test_deps(HashMap::new());
        let (pipeline, _tx) = IngestPipeline::start(
            &IngestConfig {
                workers: 2,
                ..Default::default()
            },
            deps.clone(),
        );
        let (id, mut rx) = deps.hub.register();
        deps.hub.subscribe(&id, "/topic/device/D1").unwrap();

        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31","latitude":"25.2","longitude":"55.3","speed":"40","status":"N2"}"#;
        for _ in 0..2 {
            assert!(
                pipeline
                    .inject(InboundMessage {
                        topic: "devices/D1/location".to_string(),
                        payload: payload.to_string(),
                    })
                    .await
            );
        }

        // The second sample stopping at the dedup gate means the first has
        // fully cleared the pipeline (one worker, in order).
        let metrics = deps.metrics.clone();
        wait_until(move || Metrics::get(&metrics.dedup_rejected) == 1).await;

        assert_eq!(Metrics::get(&deps.metrics.messages_received), 2);
        // Exactly one row queued for persistence and one device broadcast.
        assert_eq!(deps.batch.depth(), 1);
        assert_eq!(drain_count(&mut rx), 1);
    }

    #[tokio::test]
    async fn owner_scoped_fanout_follows_the_vehicle_record() {
        let mut owners = HashMap::new();
        owners.insert(
            "D2".to_string(),
            OwnerRefs {
                dealer_id: Some(7),
                user_id: Some(42),
                ..Default::default()
            },
        );
        let (deps, _shutdown) = test_deps(owners);
        let (pipeline, _tx) = IngestPipeline::start(
            &IngestConfig {
                workers: 2,
                ..Default::default()
            },
            deps.clone(),
        );

        let subscribe = |topic: &str| {
            let (id, rx) = deps.hub.register();
            deps.hub.subscribe(&id, topic).unwrap();
            rx
        };
        let mut all_rx = subscribe("/topic/location-updates");
        let mut device_rx = subscribe("/topic/device/D2");
        let mut dealer_rx = subscribe("/topic/location-updates/dealer/7");
        let mut user_rx = subscribe("/topic/location-updates/user/42");
        let mut admin_rx = subscribe("/topic/location-updates/admin/7");
        let mut client_rx = subscribe("/topic/location-updates/client/7");

        let payload = r#"{"deviceID":"D2","timestamp":"2025-07-09 08:15:31","latitude":"25.2","longitude":"55.3"}"#;
        assert!(
            pipeline
                .inject(InboundMessage {
                    topic: "devices/D2/location".to_string(),
                    payload: payload.to_string(),
                })
                .await
        );

        // Both role topics have subscribers; the user topic publishes last.
        let metrics = deps.metrics.clone();
        wait_until(move || Metrics::get(&metrics.broadcasts_role_scoped) == 2).await;

        assert_eq!(drain_count(&mut all_rx), 1);
        assert_eq!(drain_count(&mut device_rx), 1);
        assert_eq!(drain_count(&mut dealer_rx), 1);
        assert_eq!(drain_count(&mut user_rx), 1);
        assert_eq!(drain_count(&mut admin_rx), 0);
        assert_eq!(drain_count(&mut client_rx), 0);
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        for workers in [1usize, 4, 16, 32] {
            let a = shard_for("D1", workers);
            let b = shard_for("D1", workers);
            assert_eq!(a, b);
            assert!(a < workers);
        }
    }

    #[test]
    fn shards_spread_across_workers() {
        let workers = 16;
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(shard_for(&format!("D{i}"), workers));
        }
        // Not a uniformity proof, just a sanity check that the hash isn't
        // collapsing everything onto one worker.
        assert!(seen.len() > workers / 2);
    }

    #[test]
    fn dispatch_key_is_the_device_not_the_topic() {
        // The same device publishing over different channels (shared
        // wildcard topic, API injection) must keep one shard.
        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31"}"#;
        let from_broker = crate::models::sample::sniff_device_id(payload).unwrap();
        assert_eq!(from_broker, "D1");
        assert_eq!(shard_for(from_broker, 16), shard_for("D1", 16));

        // Only a payload with no readable device falls back to the topic.
        let anonymous = r#"{"timestamp":"2025-07-09 08:15:31"}"#;
        assert!(crate::models::sample::sniff_device_id(anonymous).is_none());
    }
}
