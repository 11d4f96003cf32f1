use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Timelike;

use crate::broadcast::BroadcastHub;
use crate::config::{AlertConfig, BroadcastConfig};
use crate::models::alert::{Alert, AlertKind, AlertLevel};
use crate::models::sample::LocationSample;

/// Evaluates every accepted sample against the alert rules and publishes
/// the survivors on `/topic/alerts`.
///
/// Three gates keep the stream quiet under a misbehaving device: a muted
/// set per kind, a short dedup window per (kind, device), and a token
/// bucket per kind capped at the configured events per hour. Email/SMS
/// delivery is the business of whatever subscribes to the alert topic.
pub struct AlertEngine {
    hub: Arc<BroadcastHub>,
    broadcast_cfg: BroadcastConfig,
    alert_cfg: AlertConfig,
    buckets: Mutex<HashMap<AlertKind, TokenBucket>>,
    recent: Mutex<HashMap<(AlertKind, String), Instant>>,
    muted: RwLock<HashSet<AlertKind>>,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_hour: u32) -> Self {
        Self {
            tokens: per_hour as f64,
            capacity: per_hour as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let refill_per_sec = self.capacity / 3600.0;
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl AlertEngine {
    pub fn new(
        hub: Arc<BroadcastHub>,
        broadcast_cfg: BroadcastConfig,
        alert_cfg: AlertConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            broadcast_cfg,
            alert_cfg,
            buckets: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            muted: RwLock::new(HashSet::new()),
        })
    }

    /// Muting a kind silences it entirely until unmuted; evaluation and
    /// persistence are unaffected.
    pub fn mute(&self, kind: AlertKind) {
        self.muted.write().expect("muted lock").insert(kind);
        tracing::info!("alert kind {} muted", kind.as_str());
    }

    pub fn unmute(&self, kind: AlertKind) {
        self.muted.write().expect("muted lock").remove(&kind);
        tracing::info!("alert kind {} unmuted", kind.as_str());
    }

    pub fn is_muted(&self, kind: AlertKind) -> bool {
        self.muted.read().expect("muted lock").contains(&kind)
    }

    pub fn muted_kinds(&self) -> Vec<&'static str> {
        self.muted
            .read()
            .expect("muted lock")
            .iter()
            .map(|k| k.as_str())
            .collect()
    }

    pub fn evaluate(&self, sample: &LocationSample) {
        if let Some(speed) = sample.speed {
            if speed > self.broadcast_cfg.alert_speed {
                self.raise(
                    Alert::new(
                        AlertLevel::Critical,
                        AlertKind::Speed,
                        format!(
                            "device {} at {speed:.0} km/h exceeds limit {:.0}",
                            sample.device_id, self.broadcast_cfg.alert_speed
                        ),
                    )
                    .for_device(&sample.device_id)
                    .detail("speed", speed)
                    .detail("threshold", self.broadcast_cfg.alert_speed),
                );
            }
        }

        if sample.ignition == Some(true) && !self.within_operating_hours(sample) {
            self.raise(
                Alert::new(
                    AlertLevel::Warning,
                    AlertKind::OutOfHoursIgnition,
                    format!(
                        "device {} ignition ON at {} outside {:02}:00-{:02}:00",
                        sample.device_id,
                        sample.recorded_at.time(),
                        self.broadcast_cfg.hours_start,
                        self.broadcast_cfg.hours_end
                    ),
                )
                .for_device(&sample.device_id),
            );
        }

        if sample.has_suspicious_coordinates() {
            self.raise(
                Alert::new(
                    AlertLevel::Warning,
                    AlertKind::SuspiciousCoordinates,
                    format!("device {} reported (0, 0)", sample.device_id),
                )
                .for_device(&sample.device_id),
            );
        }

        if sample.panic {
            self.raise(
                Alert::new(
                    AlertLevel::Critical,
                    AlertKind::Panic,
                    format!("device {} raised the panic flag", sample.device_id),
                )
                .for_device(&sample.device_id)
                .detail("latitude", sample.latitude)
                .detail("longitude", sample.longitude),
            );
        }
    }

    /// System alerts (batch failures, shutdown escalation) skip the dedup
    /// window but still respect the muted set and the per-kind bucket.
    pub fn raise_system(&self, alert: Alert) {
        if self.is_muted(alert.kind) {
            return;
        }
        if self.take_token(alert.kind) {
            self.hub.publish_alert(&alert);
        } else {
            tracing::warn!("alert {} suppressed by hourly cap", alert.kind.as_str());
        }
    }

    fn raise(&self, alert: Alert) {
        let device = alert.device_id.clone().unwrap_or_default();
        let key = (alert.kind, device);
        let window = Duration::from_secs(self.alert_cfg.dedup_window_secs);
        {
            let mut recent = self.recent.lock().expect("recent lock");
            let now = Instant::now();
            if let Some(prev) = recent.get(&key) {
                if now.duration_since(*prev) < window {
                    return;
                }
            }
            recent.insert(key, now);
            if recent.len() > 10_000 {
                recent.retain(|_, t| t.elapsed() < window);
            }
        }
        self.raise_system(alert);
    }

    fn take_token(&self, kind: AlertKind) -> bool {
        self.buckets
            .lock()
            .expect("bucket lock")
            .entry(kind)
            .or_insert_with(|| TokenBucket::new(self.alert_cfg.per_hour))
            .try_take()
    }

    /// The window is in the device's own wall clock; sample timestamps are
    /// never timezone-shifted, so the hour can be read off directly.
    fn within_operating_hours(&self, sample: &LocationSample) -> bool {
        let hour = sample.recorded_at.hour();
        hour >= self.broadcast_cfg.hours_start && hour < self.broadcast_cfg.hours_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use chrono::NaiveDateTime;

    fn engine(per_hour: u32, dedup_secs: u64) -> (Arc<AlertEngine>, Arc<BroadcastHub>) {
        let hub = BroadcastHub::new(BroadcastConfig::default(), Metrics::new());
        let alert_cfg = AlertConfig {
            per_hour,
            dedup_window_secs: dedup_secs,
            ..Default::default()
        };
        let engine = AlertEngine::new(hub.clone(), BroadcastConfig::default(), alert_cfg);
        (engine, hub)
    }

    fn sample(device: &str, ts: &str) -> LocationSample {
        let recorded_at = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap();
        LocationSample {
            latitude: Some(25.2),
            longitude: Some(55.3),
            ..LocationSample::new(device, recorded_at)
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn speeding_raises_a_critical_alert() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut s = sample("D5", "2025-07-09 12:00:00");
        s.speed = Some(180.0);
        engine.evaluate(&s);

        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["kind"], "SPEED_ALERT");
        assert_eq!(alerts[0]["level"], "CRITICAL");
        assert_eq!(alerts[0]["device_id"], "D5");
    }

    #[tokio::test]
    async fn speed_at_threshold_is_quiet() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut s = sample("D5", "2025-07-09 12:00:00");
        s.speed = Some(120.0);
        engine.evaluate(&s);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn hourly_cap_limits_one_kind() {
        let (engine, hub) = engine(3, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        for i in 0..10 {
            // Distinct devices step around the dedup window; only the
            // bucket limits here.
            let mut s = sample(&format!("D{i}"), "2025-07-09 12:00:00");
            s.speed = Some(200.0);
            engine.evaluate(&s);
        }
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn dedup_window_suppresses_repeats_for_one_device() {
        let (engine, hub) = engine(100, 300);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut s = sample("D5", "2025-07-09 12:00:00");
        s.speed = Some(200.0);
        engine.evaluate(&s);
        engine.evaluate(&s);
        engine.evaluate(&s);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn ignition_outside_hours_warns() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut night = sample("D6", "2025-07-09 03:30:00");
        night.ignition = Some(true);
        engine.evaluate(&night);

        let mut day = sample("D7", "2025-07-09 10:30:00");
        day.ignition = Some(true);
        engine.evaluate(&day);

        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["kind"], "OUT_OF_HOURS_IGNITION");
        assert_eq!(alerts[0]["device_id"], "D6");
    }

    #[tokio::test]
    async fn hours_boundaries_are_start_inclusive_end_exclusive() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut at_start = sample("D1", "2025-07-09 06:00:00");
        at_start.ignition = Some(true);
        engine.evaluate(&at_start);
        assert!(drain(&mut rx).is_empty());

        let mut at_end = sample("D2", "2025-07-09 22:00:00");
        at_end.ignition = Some(true);
        engine.evaluate(&at_end);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn zero_coordinates_and_panic_raise() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut s = sample("D8", "2025-07-09 12:00:00");
        s.latitude = Some(0.0);
        s.longitude = Some(0.0);
        s.panic = true;
        engine.evaluate(&s);

        let kinds: Vec<String> = drain(&mut rx)
            .iter()
            .map(|a| a["kind"].as_str().unwrap().to_string())
            .collect();
        assert!(kinds.contains(&"SUSPICIOUS_COORDINATES".to_string()));
        assert!(kinds.contains(&"PANIC_ALERT".to_string()));
    }

    #[tokio::test]
    async fn muted_kind_is_silent_until_unmuted() {
        let (engine, hub) = engine(10, 0);
        let (id, mut rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        engine.mute(AlertKind::Speed);
        assert!(engine.is_muted(AlertKind::Speed));
        assert_eq!(engine.muted_kinds(), vec!["SPEED_ALERT"]);

        let mut s = sample("D5", "2025-07-09 12:00:00");
        s.speed = Some(200.0);
        engine.evaluate(&s);
        assert!(drain(&mut rx).is_empty());

        // Another kind stays live while one is muted.
        let mut p = sample("D6", "2025-07-09 12:00:00");
        p.panic = true;
        engine.evaluate(&p);
        assert_eq!(drain(&mut rx).len(), 1);

        engine.unmute(AlertKind::Speed);
        let mut again = sample("D7", "2025-07-09 12:00:00");
        again.speed = Some(200.0);
        engine.evaluate(&again);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn alert_counter_increments() {
        let metrics = Metrics::new();
        let hub = BroadcastHub::new(BroadcastConfig::default(), metrics.clone());
        let engine = AlertEngine::new(hub.clone(), BroadcastConfig::default(), AlertConfig::default());
        let (id, _rx) = hub.register();
        hub.subscribe(&id, "/topic/alerts").unwrap();

        let mut s = sample("D5", "2025-07-09 12:00:00");
        s.speed = Some(200.0);
        engine.evaluate(&s);
        assert_eq!(Metrics::get(&metrics.broadcasts_alert), 1);
    }
}
