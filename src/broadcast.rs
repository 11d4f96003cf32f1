use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BroadcastConfig;
use crate::error::ValidationError;
use crate::metrics::Metrics;
use crate::models::alert::Alert;
use crate::models::sample::{LocationSample, OwnerRefs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerRole {
    Dealer,
    Admin,
    Client,
    User,
    Superadmin,
}

impl OwnerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerRole::Dealer => "dealer",
            OwnerRole::Admin => "admin",
            OwnerRole::Client => "client",
            OwnerRole::User => "user",
            OwnerRole::Superadmin => "superadmin",
        }
    }
}

/// The push-channel topic shapes clients may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    AllLocations,
    RoleScoped(OwnerRole, i64),
    Device(String),
    Alerts,
    Stats,
}

impl Topic {
    pub fn parse(s: &str) -> Result<Topic, ValidationError> {
        let bad = || ValidationError::Malformed(format!("unknown topic: {s}"));
        match s {
            "/topic/location-updates" => return Ok(Topic::AllLocations),
            "/topic/alerts" => return Ok(Topic::Alerts),
            "/topic/stats" => return Ok(Topic::Stats),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("/topic/location-updates/") {
            let (role, id) = rest.split_once('/').ok_or_else(bad)?;
            let role = match role {
                "dealer" => OwnerRole::Dealer,
                "admin" => OwnerRole::Admin,
                "client" => OwnerRole::Client,
                "user" => OwnerRole::User,
                "superadmin" => OwnerRole::Superadmin,
                _ => return Err(bad()),
            };
            let id: i64 = id.parse().map_err(|_| bad())?;
            return Ok(Topic::RoleScoped(role, id));
        }
        if let Some(device) = s.strip_prefix("/topic/device/") {
            if device.is_empty() || device.contains('/') {
                return Err(bad());
            }
            return Ok(Topic::Device(device.to_string()));
        }
        Err(bad())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::AllLocations => write!(f, "/topic/location-updates"),
            Topic::RoleScoped(role, id) => {
                write!(f, "/topic/location-updates/{}/{id}", role.as_str())
            }
            Topic::Device(id) => write!(f, "/topic/device/{id}"),
            Topic::Alerts => write!(f, "/topic/alerts"),
            Topic::Stats => write!(f, "/topic/stats"),
        }
    }
}

/// Role-scoped topics a sample fans out to, one per non-null owner ref.
pub fn role_topics(owners: &OwnerRefs) -> Vec<Topic> {
    let mut topics = Vec::new();
    let pairs = [
        (OwnerRole::Dealer, owners.dealer_id),
        (OwnerRole::Admin, owners.admin_id),
        (OwnerRole::Client, owners.client_id),
        (OwnerRole::User, owners.user_id),
        (OwnerRole::Superadmin, owners.superadmin_id),
    ];
    for (role, id) in pairs {
        if let Some(id) = id {
            topics.push(Topic::RoleScoped(role, id));
        }
    }
    topics
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<String>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    subscriptions: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub topics: usize,
    pub subscriptions: usize,
}

/// Session/subscription registry and fan-out point.
///
/// Delivery to one session is an unbounded channel send; the WebSocket task
/// on the other end serializes per-session writes, which gives per-topic
/// ordering as long as publishers call in order. A failed send means the
/// session is gone and triggers its bidirectional cleanup. Per-topic
/// publish failures never stop the remaining topics.
pub struct BroadcastHub {
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
    topics: RwLock<HashMap<String, HashSet<Uuid>>>,
    last_broadcast: Mutex<HashMap<String, Instant>>,
    cfg: BroadcastConfig,
    metrics: Arc<Metrics>,
}

impl BroadcastHub {
    pub fn new(cfg: BroadcastConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            last_broadcast: Mutex::new(HashMap::new()),
            cfg,
            metrics,
        })
    }

    pub fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let entry = Arc::new(SessionEntry {
            tx,
            connected_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
        });
        self.sessions.write().expect("sessions lock").insert(id, entry);
        tracing::debug!("push session registered: {id}");
        (id, rx)
    }

    pub fn touch(&self, session_id: &Uuid) {
        if let Some(entry) = self.sessions.read().expect("sessions lock").get(session_id) {
            *entry.last_activity.lock().expect("activity lock") = Instant::now();
        }
    }

    pub fn subscribe(&self, session_id: &Uuid, topic: &str) -> Result<(), ValidationError> {
        let parsed = Topic::parse(topic)?;
        let canonical = parsed.to_string();

        let sessions = self.sessions.read().expect("sessions lock");
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ValidationError::Malformed("unknown session".into()))?;
        entry
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .insert(canonical.clone());
        *entry.last_activity.lock().expect("activity lock") = Instant::now();
        drop(sessions);

        self.topics
            .write()
            .expect("topics lock")
            .entry(canonical)
            .or_default()
            .insert(*session_id);
        Ok(())
    }

    pub fn unsubscribe(&self, session_id: &Uuid, topic: &str) -> Result<(), ValidationError> {
        let canonical = Topic::parse(topic)?.to_string();
        if let Some(entry) = self.sessions.read().expect("sessions lock").get(session_id) {
            entry
                .subscriptions
                .lock()
                .expect("subscriptions lock")
                .remove(&canonical);
        }
        let mut topics = self.topics.write().expect("topics lock");
        if let Some(set) = topics.get_mut(&canonical) {
            set.remove(session_id);
            if set.is_empty() {
                topics.remove(&canonical);
            }
        }
        Ok(())
    }

    /// Remove the session and every topic membership it held.
    pub fn close_session(&self, session_id: &Uuid) {
        let entry = self.sessions.write().expect("sessions lock").remove(session_id);
        let Some(entry) = entry else { return };
        let subscriptions = entry.subscriptions.lock().expect("subscriptions lock").clone();
        let mut topics = self.topics.write().expect("topics lock");
        for topic in subscriptions {
            if let Some(set) = topics.get_mut(&topic) {
                set.remove(session_id);
                if set.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
        tracing::debug!("push session closed: {session_id}");
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .expect("topics lock")
            .get(&topic.to_string())
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Deliver a JSON payload to every subscriber of one topic. Dead
    /// sessions found along the way are cleaned up; errors only feed the
    /// counter.
    pub fn publish(&self, topic: &Topic, payload: &str) -> usize {
        let key = topic.to_string();
        let subscriber_ids: Vec<Uuid> = {
            let topics = self.topics.read().expect("topics lock");
            match topics.get(&key) {
                Some(set) if !set.is_empty() => set.iter().copied().collect(),
                _ => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read().expect("sessions lock");
            for id in &subscriber_ids {
                match sessions.get(id) {
                    Some(entry) => {
                        if entry.tx.send(payload.to_string()).is_ok() {
                            delivered += 1;
                        } else {
                            dead.push(*id);
                        }
                    }
                    None => dead.push(*id),
                }
            }
        }
        for id in dead {
            Metrics::incr(&self.metrics.broadcast_errors);
            self.close_session(&id);
        }
        delivered
    }

    /// Fan an accepted sample out per the routing rule: the generic topic,
    /// the single-device topic, and one role-scoped topic per non-null
    /// owner ref. `enriched = false` (vehicle lookup miss) keeps the sample
    /// off every role-scoped topic.
    pub fn publish_sample(&self, sample: &LocationSample, enriched: bool) {
        if !self.rate_gate(&sample.device_id) {
            Metrics::incr(&self.metrics.broadcast_rate_limited);
            return;
        }

        let payload = match serde_json::to_string(sample) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("sample serialization failed: {e}");
                Metrics::incr(&self.metrics.broadcast_errors);
                return;
            }
        };

        Metrics::incr(&self.metrics.broadcasts_total);
        self.publish(&Topic::AllLocations, &payload);
        self.publish(&Topic::Device(sample.device_id.clone()), &payload);
        if enriched {
            for topic in role_topics(&sample.owners) {
                if self.publish(&topic, &payload) > 0 {
                    Metrics::incr(&self.metrics.broadcasts_role_scoped);
                }
            }
        }
    }

    pub fn publish_alert(&self, alert: &Alert) {
        match serde_json::to_string(alert) {
            Ok(payload) => {
                Metrics::incr(&self.metrics.broadcasts_alert);
                self.publish(&Topic::Alerts, &payload);
            }
            Err(e) => {
                tracing::error!("alert serialization failed: {e}");
                Metrics::incr(&self.metrics.broadcast_errors);
            }
        }
    }

    /// Per-device broadcast throttle. Persistence is never throttled, only
    /// the fan-out.
    fn rate_gate(&self, device_id: &str) -> bool {
        let min_interval = Duration::from_millis(self.cfg.rate_limit_ms);
        let mut last = self.last_broadcast.lock().expect("rate lock");
        let now = Instant::now();
        match last.get(device_id) {
            Some(prev) if now.duration_since(*prev) < min_interval => false,
            _ => {
                last.insert(device_id.to_string(), now);
                true
            }
        }
    }

    /// Periodic sweep: close idle sessions, drop empty topic sets, shrink
    /// the rate-limit map.
    pub fn sweep(&self) -> usize {
        let idle_cutoff = Duration::from_secs(self.cfg.idle_close_secs);
        let idle: Vec<(Uuid, Duration)> = {
            let sessions = self.sessions.read().expect("sessions lock");
            sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.last_activity.lock().expect("activity lock").elapsed() > idle_cutoff
                })
                .map(|(id, entry)| (*id, entry.connected_at.elapsed()))
                .collect()
        };
        for (id, age) in &idle {
            tracing::info!("closing idle push session {id} (connected {}s)", age.as_secs());
            self.close_session(id);
        }

        {
            let sessions = self.sessions.read().expect("sessions lock");
            let mut topics = self.topics.write().expect("topics lock");
            topics.retain(|_, set| {
                set.retain(|id| sessions.contains_key(id));
                !set.is_empty()
            });
        }
        {
            let mut last = self.last_broadcast.lock().expect("rate lock");
            let horizon = Duration::from_secs(60).max(Duration::from_millis(self.cfg.rate_limit_ms * 10));
            last.retain(|_, t| t.elapsed() < horizon);
        }
        idle.len()
    }

    /// Shutdown: push a goodbye frame and drop every session.
    pub fn close_all(&self, reason: &str) {
        let goodbye = serde_json::json!({ "event": "server-closing", "reason": reason }).to_string();
        let ids: Vec<Uuid> = self.sessions.read().expect("sessions lock").keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.sessions.read().expect("sessions lock").get(&id) {
                let _ = entry.tx.send(goodbye.clone());
            }
            self.close_session(&id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("sessions lock").len()
    }

    pub fn stats(&self) -> HubStats {
        let sessions = self.sessions.read().expect("sessions lock");
        let topics = self.topics.read().expect("topics lock");
        HubStats {
            sessions: sessions.len(),
            topics: topics.len(),
            subscriptions: topics.values().map(|s| s.len()).sum(),
        }
    }
}
