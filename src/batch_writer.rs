use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::alert_engine::AlertEngine;
use crate::config::BatchConfig;
use crate::error::PersistenceError;
use crate::metrics::Metrics;
use crate::models::alert::{Alert, AlertKind, AlertLevel};
use crate::models::sample::LocationSample;
use crate::partition_manager::PartitionManager;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;

/// Outcome of handing a sample to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue ≥ 90% and this device is reporting faster than the floor.
    Shed,
    /// Queue full past the block timeout; the device's oldest queued
    /// sample made room.
    ReplacedOldest,
}

struct QueueInner {
    dq: VecDeque<LocationSample>,
    /// Device wall-clock of the last enqueued sample per device, for the
    /// shed-floor interval check.
    last_enqueued: HashMap<String, NaiveDateTime>,
}

struct Queue {
    inner: Mutex<QueueInner>,
    /// Woken when a full batch is ready.
    batch_ready: Notify,
    /// Woken after a flush takes samples out.
    drained: Notify,
}

/// Buffering persistence front-end.
///
/// Samples queue up to `max_queue`; a background flusher empties the queue
/// whenever a full batch accumulates or the flush interval elapses,
/// whichever comes first. Flushes are idempotent upserts, so a retried
/// batch can never double-write.
#[derive(Clone)]
pub struct BatchWriter {
    queue: Arc<Queue>,
    cfg: BatchConfig,
    metrics: Arc<Metrics>,
}

impl BatchWriter {
    /// Spawn the flusher and hand back the submit side. The join handle
    /// completes once shutdown has drained the queue.
    pub fn start(
        cfg: BatchConfig,
        store: Store,
        partitions: Arc<PartitionManager>,
        alerts: Arc<AlertEngine>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
    ) -> (Self, JoinHandle<()>) {
        let writer = Self {
            queue: Arc::new(Queue {
                inner: Mutex::new(QueueInner {
                    dq: VecDeque::new(),
                    last_enqueued: HashMap::new(),
                }),
                batch_ready: Notify::new(),
                drained: Notify::new(),
            }),
            cfg: cfg.clone(),
            metrics: metrics.clone(),
        };

        let flusher = Flusher {
            queue: writer.queue.clone(),
            cfg,
            store,
            partitions,
            alerts,
            metrics,
        };
        let handle = tokio::spawn(flusher.run(shutdown));
        (writer, handle)
    }

    pub fn depth(&self) -> usize {
        self.queue.inner.lock().expect("queue lock").dq.len()
    }

    pub fn max_queue(&self) -> usize {
        self.cfg.max_queue
    }

    /// Enqueue one accepted sample, applying the backpressure contract:
    /// shed fast reporters at ≥ 90% occupancy, and at 100% block until
    /// drain or 250 ms, then displace the device's oldest queued sample.
    pub async fn submit(&self, sample: LocationSample) -> SubmitOutcome {
        loop {
            {
                let mut inner = self.queue.inner.lock().expect("queue lock");
                let depth = inner.dq.len();

                if depth < self.cfg.max_queue {
                    if depth * 10 >= self.cfg.max_queue * 9 && self.is_sheddable(&inner, &sample) {
                        Metrics::incr(&self.metrics.samples_shed);
                        return SubmitOutcome::Shed;
                    }
                    self.push(&mut inner, sample);
                    if inner.dq.len() >= self.cfg.size {
                        self.queue.batch_ready.notify_one();
                    }
                    return SubmitOutcome::Queued;
                }
            }

            // Full: wait for the flusher, then retry once before displacing.
            let drained = self.queue.drained.notified();
            if tokio::time::timeout(Duration::from_millis(250), drained).await.is_ok() {
                continue;
            }

            let mut inner = self.queue.inner.lock().expect("queue lock");
            if inner.dq.len() < self.cfg.max_queue {
                continue;
            }
            let victim = inner
                .dq
                .iter()
                .position(|s| s.device_id == sample.device_id)
                .unwrap_or(0);
            inner.dq.remove(victim);
            Metrics::incr(&self.metrics.samples_shed);
            self.push(&mut inner, sample);
            return SubmitOutcome::ReplacedOldest;
        }
    }

    fn push(&self, inner: &mut QueueInner, sample: LocationSample) {
        inner
            .last_enqueued
            .insert(sample.device_id.clone(), sample.recorded_at);
        inner.dq.push_back(sample);
    }

    fn is_sheddable(&self, inner: &QueueInner, sample: &LocationSample) -> bool {
        let floor = chrono::Duration::milliseconds(self.cfg.shed_floor_ms as i64);
        match inner.last_enqueued.get(&sample.device_id) {
            Some(last) => sample.recorded_at - *last < floor,
            None => false,
        }
    }
}

struct Flusher {
    queue: Arc<Queue>,
    cfg: BatchConfig,
    store: Store,
    partitions: Arc<PartitionManager>,
    alerts: Arc<AlertEngine>,
    metrics: Arc<Metrics>,
}

impl Flusher {
    async fn run(self, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "batch writer started (batch={}, interval={}ms, queue={})",
            self.cfg.size,
            self.cfg.interval_ms,
            self.cfg.max_queue
        );
        loop {
            tokio::select! {
                _ = self.queue.batch_ready.notified() => self.flush_ready(false).await,
                _ = interval.tick() => self.flush_ready(true).await,
                _ = shutdown.recv() => {
                    tracing::info!("batch writer draining on shutdown");
                    self.flush_ready(true).await;
                    return;
                }
            }
        }
    }

    /// Flush full batches; with `force` also the final partial one.
    async fn flush_ready(&self, force: bool) {
        loop {
            let batch = {
                let mut inner = self.queue.inner.lock().expect("queue lock");
                if inner.dq.is_empty() || (!force && inner.dq.len() < self.cfg.size) {
                    break;
                }
                let take = inner.dq.len().min(self.cfg.size);
                inner.dq.drain(..take).collect::<Vec<_>>()
            };
            self.queue.drained.notify_waiters();
            self.flush_batch(batch).await;
        }
    }

    async fn flush_batch(&self, batch: Vec<LocationSample>) {
        let merged = merge_batch(batch);
        for (month, group) in group_by_month(merged) {
            if let Some(first) = group.first() {
                if let Err(e) = self.partitions.ensure_for(first.recorded_at).await {
                    tracing::warn!("partition ensure for {month:?} failed: {e}");
                }
            }
            self.flush_group(group).await;
        }
    }

    /// Up to `retries` retry rounds after the first failure, backing off
    /// 250 ms, 1 s, 4 s under the defaults; the batch dead-letters once the
    /// ladder is spent.
    async fn flush_group(&self, group: Vec<LocationSample>) {
        let count = group.len() as u64;
        let mut attempt = 0u32;
        loop {
            match self.store.upsert_history_batch(&group).await {
                Ok(_) => {
                    Metrics::add(&self.metrics.messages_saved, count);
                    Metrics::incr(&self.metrics.batches_flushed);
                    return;
                }
                Err(e) if e.retryable() && attempt < self.cfg.retries => {
                    let backoff =
                        Duration::from_millis(self.cfg.backoff_ms * 4u64.pow(attempt));
                    tracing::warn!(
                        "batch flush attempt {} failed ({e}), retrying in {backoff:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dead_letter(&group, &e).await;
                    return;
                }
            }
        }
    }

    /// A batch that exhausted its retries is preserved on disk and dropped
    /// from the queue; the pipeline keeps going.
    async fn dead_letter(&self, group: &[LocationSample], error: &PersistenceError) {
        let count = group.len() as u64;
        Metrics::add(&self.metrics.messages_failed, count);
        Metrics::incr(&self.metrics.batches_dead_lettered);
        tracing::error!("batch of {count} dead-lettered: {error}");

        let line = serde_json::json!({
            "failed_at": chrono::Utc::now().naive_utc(),
            "error": error.to_string(),
            "samples": group,
        });
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.dead_letter_path)
            .await
        {
            Ok(mut file) => {
                let mut payload = line.to_string();
                payload.push('\n');
                if let Err(e) = file.write_all(payload.as_bytes()).await {
                    tracing::error!("dead-letter write failed: {e}");
                }
            }
            Err(e) => tracing::error!(
                "dead-letter file {} unavailable: {e}",
                self.cfg.dead_letter_path
            ),
        }

        self.alerts.raise_system(
            Alert::new(
                AlertLevel::Critical,
                AlertKind::BatchFailed,
                format!("batch of {count} samples failed after {} retries: {error}", self.cfg.retries),
            )
            .detail("batch_size", count)
            .detail("dead_letter_path", self.cfg.dead_letter_path.as_str()),
        );
    }
}

/// Collapse duplicate `(device, timestamp)` keys inside one batch, merging
/// field-wise: a later non-null value wins, a null one keeps the earlier
/// value. Required because one `ON CONFLICT DO UPDATE` statement may not
/// touch the same row twice, and it reproduces exactly what two sequential
/// upserts would have stored.
pub fn merge_batch(batch: Vec<LocationSample>) -> Vec<LocationSample> {
    let mut index: HashMap<(String, NaiveDateTime), usize> = HashMap::new();
    let mut merged: Vec<LocationSample> = Vec::with_capacity(batch.len());
    for sample in batch {
        let key = (sample.device_id.clone(), sample.recorded_at);
        match index.get(&key) {
            Some(&i) => merge_into(&mut merged[i], sample),
            None => {
                index.insert(key, merged.len());
                merged.push(sample);
            }
        }
    }
    merged
}

fn merge_into(existing: &mut LocationSample, incoming: LocationSample) {
    existing.latitude = incoming.latitude.or(existing.latitude);
    existing.longitude = incoming.longitude.or(existing.longitude);
    existing.speed = incoming.speed.or(existing.speed);
    existing.course = incoming.course.or(existing.course.take());
    existing.ignition = incoming.ignition.or(existing.ignition);
    existing.vehicle_status = incoming.vehicle_status.or(existing.vehicle_status.take());
    existing.gsm_strength = incoming.gsm_strength.or(existing.gsm_strength.take());
    existing.sequence_no = incoming.sequence_no.or(existing.sequence_no.take());
    existing.panic = existing.panic || incoming.panic;
    existing.owners.dealer_id = incoming.owners.dealer_id.or(existing.owners.dealer_id);
    existing.owners.admin_id = incoming.owners.admin_id.or(existing.owners.admin_id);
    existing.owners.client_id = incoming.owners.client_id.or(existing.owners.client_id);
    existing.owners.user_id = incoming.owners.user_id.or(existing.owners.user_id);
    existing.owners.superadmin_id = incoming.owners.superadmin_id.or(existing.owners.superadmin_id);
}

/// Partition routing: sub-batches per calendar month, preserving the
/// submission order inside each group. A batch straddling a month boundary
/// yields one group per side.
pub fn group_by_month(
    batch: Vec<LocationSample>,
) -> Vec<((i32, u32), Vec<LocationSample>)> {
    let mut order: Vec<(i32, u32)> = Vec::new();
    let mut groups: HashMap<(i32, u32), Vec<LocationSample>> = HashMap::new();
    for sample in batch {
        let key = sample.month_key();
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(sample);
    }
    order
        .into_iter()
        .map(|key| {
            let group = groups.remove(&key).expect("group exists");
            (key, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device: &str, ts: &str) -> LocationSample {
        let recorded_at = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap();
        LocationSample::new(device, recorded_at)
    }

    #[test]
    fn merge_keeps_distinct_keys() {
        let batch = vec![
            sample("D1", "2025-07-09 08:00:00"),
            sample("D1", "2025-07-09 08:00:01"),
            sample("D2", "2025-07-09 08:00:00"),
        ];
        assert_eq!(merge_batch(batch).len(), 3);
    }

    #[test]
    fn merge_disjoint_fields_commutes() {
        let mut a = sample("D1", "2025-07-09 08:00:00");
        a.latitude = Some(25.2);
        let mut b = sample("D1", "2025-07-09 08:00:00");
        b.speed = Some(40.0);

        let ab = merge_batch(vec![a.clone(), b.clone()]);
        let ba = merge_batch(vec![b, a]);
        assert_eq!(ab.len(), 1);
        assert_eq!(ab[0].latitude, ba[0].latitude);
        assert_eq!(ab[0].speed, ba[0].speed);
        assert_eq!(ab[0].latitude, Some(25.2));
        assert_eq!(ab[0].speed, Some(40.0));
    }

    #[test]
    fn merge_overlapping_fields_later_wins() {
        let mut a = sample("D1", "2025-07-09 08:00:00");
        a.speed = Some(40.0);
        let mut b = sample("D1", "2025-07-09 08:00:00");
        b.speed = Some(55.0);

        let merged = merge_batch(vec![a, b]);
        assert_eq!(merged[0].speed, Some(55.0));
    }

    #[test]
    fn merge_null_field_keeps_earlier_value() {
        let mut a = sample("D1", "2025-07-09 08:00:00");
        a.latitude = Some(25.2);
        let b = sample("D1", "2025-07-09 08:00:00");

        let merged = merge_batch(vec![a, b]);
        assert_eq!(merged[0].latitude, Some(25.2));
    }

    #[test]
    fn month_straddle_splits_into_two_groups() {
        let batch = vec![
            sample("D1", "2025-07-31 23:59:59"),
            sample("D1", "2025-08-01 00:00:01"),
        ];
        let groups = group_by_month(batch);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, (2025, 7));
        assert_eq!(groups[1].0, (2025, 8));
        let total: usize = groups.iter().map(|(_, g)| g.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn grouping_preserves_per_device_order() {
        let batch = vec![
            sample("D1", "2025-07-09 08:00:00"),
            sample("D1", "2025-07-09 08:00:01"),
            sample("D1", "2025-07-09 08:00:02"),
        ];
        let groups = group_by_month(batch);
        assert_eq!(groups.len(), 1);
        let times: Vec<String> = groups[0]
            .1
            .iter()
            .map(|s| s.recorded_at.to_string())
            .collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    fn writer(max_queue: usize, shed_floor_ms: u64) -> BatchWriter {
        BatchWriter {
            queue: Arc::new(Queue {
                inner: Mutex::new(QueueInner {
                    dq: VecDeque::new(),
                    last_enqueued: HashMap::new(),
                }),
                batch_ready: Notify::new(),
                drained: Notify::new(),
            }),
            cfg: BatchConfig {
                max_queue,
                shed_floor_ms,
                ..Default::default()
            },
            metrics: Metrics::new(),
        }
    }

    #[tokio::test]
    async fn fast_reporter_is_shed_under_pressure() {
        let w = writer(10, 5000);
        // Fill to 90%.
        for i in 0..9 {
            let outcome = w.submit(sample("OTHER", &format!("2025-07-09 08:00:{i:02}"))).await;
            assert_eq!(outcome, SubmitOutcome::Queued);
        }
        // Two samples one second apart from one device: under the 5 s floor.
        assert_eq!(
            w.submit(sample("D1", "2025-07-09 09:00:00")).await,
            SubmitOutcome::Queued
        );
        assert_eq!(w.depth(), 10);
        // Queue is now full; make room first so the shed path is reachable.
        w.queue.inner.lock().unwrap().dq.pop_front();
        assert_eq!(
            w.submit(sample("D1", "2025-07-09 09:00:01")).await,
            SubmitOutcome::Shed
        );
        // A slow reporter is never shed.
        w.queue.inner.lock().unwrap().dq.pop_front();
        assert_eq!(
            w.submit(sample("D1", "2025-07-09 09:01:00")).await,
            SubmitOutcome::Queued
        );
    }

    #[tokio::test]
    async fn full_queue_displaces_the_devices_oldest() {
        let w = writer(3, 0);
        w.submit(sample("D1", "2025-07-09 08:00:00")).await;
        w.submit(sample("D2", "2025-07-09 08:00:00")).await;
        w.submit(sample("D1", "2025-07-09 08:00:01")).await;

        let outcome = w.submit(sample("D1", "2025-07-09 08:00:02")).await;
        assert_eq!(outcome, SubmitOutcome::ReplacedOldest);
        assert_eq!(w.depth(), 3);

        let inner = w.queue.inner.lock().unwrap();
        let d1_times: Vec<String> = inner
            .dq
            .iter()
            .filter(|s| s.device_id == "D1")
            .map(|s| s.recorded_at.to_string())
            .collect();
        assert_eq!(d1_times, vec!["2025-07-09 08:00:01", "2025-07-09 08:00:02"]);
    }

    #[tokio::test]
    async fn failing_batch_walks_the_full_backoff_ladder_then_dead_letters() {
        use crate::alert_engine::AlertEngine;
        use crate::broadcast::BroadcastHub;
        use crate::config::{AlertConfig, BroadcastConfig, PartitionConfig};
        use crate::partition_manager::PartitionManager;

        let metrics = Metrics::new();
        let hub = BroadcastHub::new(BroadcastConfig::default(), metrics.clone());
        let alerts = AlertEngine::new(hub.clone(), BroadcastConfig::default(), AlertConfig::default());
        let (alert_id, mut alert_rx) = hub.register();
        hub.subscribe(&alert_id, "/topic/alerts").unwrap();

        // Nothing listens on port 1, so every upsert fails fast with a
        // retryable error.
        let store = Store::from_pool(
            sqlx::postgres::PgPoolOptions::new()
                .acquire_timeout(Duration::from_millis(50))
                .connect_lazy("postgres://127.0.0.1:1/unused")
                .unwrap(),
        );
        let partitions = Arc::new(PartitionManager::new(store.clone(), PartitionConfig::default()));
        let dead_letter = std::env::temp_dir()
            .join(format!("trackwave-dead-letter-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&dead_letter);

        let flusher = Flusher {
            queue: Arc::new(Queue {
                inner: Mutex::new(QueueInner {
                    dq: VecDeque::new(),
                    last_enqueued: HashMap::new(),
                }),
                batch_ready: Notify::new(),
                drained: Notify::new(),
            }),
            cfg: BatchConfig {
                retries: 3,
                backoff_ms: 10,
                dead_letter_path: dead_letter.to_string_lossy().into_owned(),
                ..Default::default()
            },
            store,
            partitions,
            alerts,
            metrics: metrics.clone(),
        };

        let started = std::time::Instant::now();
        flusher.flush_group(vec![sample("D1", "2025-07-09 08:00:00")]).await;

        // Three backoff rounds must have run: 10 ms + 40 ms + 160 ms.
        assert!(started.elapsed() >= Duration::from_millis(210));
        assert_eq!(Metrics::get(&metrics.batches_dead_lettered), 1);
        assert_eq!(Metrics::get(&metrics.messages_failed), 1);
        assert_eq!(Metrics::get(&metrics.messages_saved), 0);

        let alert: serde_json::Value =
            serde_json::from_str(&alert_rx.try_recv().unwrap()).unwrap();
        assert_eq!(alert["kind"], "BATCH_FAILED");
        assert_eq!(alert["level"], "CRITICAL");

        let contents = std::fs::read_to_string(&dead_letter).unwrap();
        assert!(contents.contains("\"device_id\":\"D1\""));
        let _ = std::fs::remove_file(&dead_letter);
    }

    #[tokio::test]
    async fn queue_never_exceeds_max() {
        let w = writer(5, 0);
        for i in 0..10 {
            w.submit(sample("D1", &format!("2025-07-09 08:00:{i:02}"))).await;
            assert!(w.depth() <= 5);
        }
    }
}
