use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{BrokerConfig, PoolConfig};
use crate::error::BrokerError;
use crate::ingest::InboundMessage;
use crate::shutdown::ShutdownSignal;

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Lost,
}

pub struct SessionHandle {
    pub id: usize,
    state: RwLock<SessionState>,
    pub messages: AtomicU64,
    /// Messages received but not yet acked (forwarding to ingest pending).
    pub inflight: AtomicU64,
}

impl SessionHandle {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(SessionState::Connecting),
            messages: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("session state lock")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().expect("session state lock") = state;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub connecting: usize,
    pub draining: usize,
    pub lost: usize,
    pub messages_total: u64,
    pub inflight: u64,
    /// Active sessions whose inflight count has hit the configured cap.
    pub saturated: usize,
    /// Heuristic device capacity: active sessions × devices per session.
    pub capacity: usize,
}

/// The pool is exhausted when every session is Lost, or every Active
/// session sits at max inflight.
pub fn pool_exhausted(stats: &PoolStats) -> bool {
    if stats.total == 0 {
        return false;
    }
    if stats.lost == stats.total {
        return true;
    }
    stats.active > 0 && stats.saturated == stats.active
}

/// Pool of long-lived MQTT subscriber sessions.
///
/// Every session owns one client + event loop task, subscribes to the
/// device topic pattern and feeds raw publishes into the ingest channel.
/// A session that loses its connection re-enters the connect cycle with
/// exponential backoff and ±20% jitter; shutdown flips it to Draining so
/// the in-flight message finishes before the task exits.
pub struct BrokerPool {
    broker_cfg: BrokerConfig,
    pool_cfg: PoolConfig,
    sessions: RwLock<Vec<Arc<SessionHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    ingest_tx: mpsc::Sender<InboundMessage>,
    shutdown: ShutdownSignal,
}

/// `ceil(expected / per_session) + 2` sessions.
pub fn target_sessions(expected_devices: usize, devices_per_session: usize) -> usize {
    expected_devices.div_ceil(devices_per_session.max(1)) + 2
}

/// Exponential backoff schedule before jitter: 1 s, 2 s, 4 s … capped at 60 s.
pub fn backoff_base(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(6);
    (RECONNECT_INITIAL * factor as u32).min(RECONNECT_CAP)
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = backoff_base(attempt);
    let jitter = rand::rng().random_range(0.8..=1.2);
    base.mul_f64(jitter)
}

impl BrokerPool {
    pub fn start(
        broker_cfg: BrokerConfig,
        pool_cfg: PoolConfig,
        ingest_tx: mpsc::Sender<InboundMessage>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let initial = target_sessions(pool_cfg.expected_devices, pool_cfg.devices_per_session)
            .clamp(pool_cfg.initial, pool_cfg.max);
        let pool = Arc::new(Self {
            broker_cfg,
            pool_cfg,
            sessions: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            ingest_tx,
            shutdown,
        });
        for _ in 0..initial {
            pool.spawn_session();
        }
        tracing::info!("broker pool started with {initial} sessions");
        pool
    }

    fn spawn_session(self: &Arc<Self>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle::new(id);
        self.sessions.write().expect("sessions lock").push(handle.clone());

        let pool = self.clone();
        let task = tokio::spawn(async move {
            pool.session_loop(handle).await;
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    async fn session_loop(self: Arc<Self>, session: Arc<SessionHandle>) {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;
        let (host, port) = match parse_broker_url(&self.broker_cfg.url) {
            Ok(hp) => hp,
            Err(e) => {
                tracing::error!("session {}: bad broker url: {e}", session.id);
                session.set_state(SessionState::Lost);
                return;
            }
        };

        'reconnect: loop {
            if shutdown.is_triggered() {
                break;
            }
            session.set_state(SessionState::Connecting);

            let client_id = format!("{}-{}", self.broker_cfg.client_id, session.id);
            let mut opts = MqttOptions::new(client_id, host.clone(), port);
            opts.set_keep_alive(Duration::from_secs(self.broker_cfg.keepalive_secs));
            opts.set_inflight(self.broker_cfg.max_inflight);
            // Acks go out only after the message is safely handed to the
            // ingest channel; an unacked message gets redelivered.
            opts.set_manual_acks(true);
            opts.set_clean_session(true);
            if let (Some(user), Some(pass)) = (&self.broker_cfg.user, &self.broker_cfg.pass) {
                opts.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut eventloop) = AsyncClient::new(opts, 64);
            if let Err(e) = client
                .subscribe(self.broker_cfg.device_topic.as_str(), QoS::AtLeastOnce)
                .await
            {
                let err = BrokerError::SubscribeFailed(e.to_string());
                tracing::error!("session {}: {err}", session.id);
                session.set_state(SessionState::Lost);
                if !self.wait_backoff(&mut shutdown, &mut attempt).await {
                    break;
                }
                continue;
            }

            loop {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("session {} connected to {}:{}", session.id, host, port);
                            session.set_state(SessionState::Active);
                            attempt = 0;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            session.messages.fetch_add(1, Ordering::Relaxed);
                            session.inflight.fetch_add(1, Ordering::Relaxed);
                            let message = InboundMessage {
                                topic: publish.topic.clone(),
                                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                            };
                            let forwarded = self.ingest_tx.send(message).await.is_ok();
                            if forwarded {
                                if let Err(e) = client.ack(&publish).await {
                                    tracing::warn!("session {}: ack failed: {e}", session.id);
                                }
                            }
                            session.inflight.fetch_sub(1, Ordering::Relaxed);
                            if !forwarded {
                                // Left unacked on purpose: the broker will
                                // redeliver once a session is back.
                                tracing::warn!("session {}: ingest channel closed", session.id);
                                session.set_state(SessionState::Draining);
                                break 'reconnect;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let err = classify_connection_error(&e);
                            session.set_state(SessionState::Lost);
                            if !err.recoverable() {
                                tracing::error!("session {}: fatal: {err}", session.id);
                                break 'reconnect;
                            }
                            tracing::warn!("session {}: {err}, reconnecting", session.id);
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        // Finish the in-flight message, then leave.
                        session.set_state(SessionState::Draining);
                        let _ = client.disconnect().await;
                        break 'reconnect;
                    }
                }
            }

            if !self.wait_backoff(&mut shutdown, &mut attempt).await {
                break;
            }
        }
        // A drained session leaves the pool; anything else ended broken.
        if session.state() == SessionState::Draining {
            self.sessions
                .write()
                .expect("sessions lock")
                .retain(|s| s.id != session.id);
        } else {
            session.set_state(SessionState::Lost);
        }
        tracing::debug!("session {} closed", session.id);
    }

    /// Sleep out the backoff; false means shutdown interrupted it.
    async fn wait_backoff(&self, shutdown: &mut ShutdownSignal, attempt: &mut u32) -> bool {
        let delay = backoff_with_jitter(*attempt);
        *attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.recv() => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let sessions = self.sessions.read().expect("sessions lock");
        let max_inflight = self.broker_cfg.max_inflight as u64;
        let mut stats = PoolStats {
            total: sessions.len(),
            active: 0,
            connecting: 0,
            draining: 0,
            lost: 0,
            messages_total: 0,
            inflight: 0,
            saturated: 0,
            capacity: 0,
        };
        for s in sessions.iter() {
            let state = s.state();
            let inflight = s.inflight.load(Ordering::Relaxed);
            match state {
                SessionState::Active => {
                    stats.active += 1;
                    if inflight >= max_inflight {
                        stats.saturated += 1;
                    }
                }
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Draining => stats.draining += 1,
                SessionState::Lost => stats.lost += 1,
            }
            stats.messages_total += s.messages.load(Ordering::Relaxed);
            stats.inflight += inflight;
        }
        stats.capacity = stats.active * self.pool_cfg.devices_per_session;
        stats
    }

    /// True iff the connected sessions can carry `n` devices AND at least
    /// 90% of the pool is connected. An exhausted pool (all Lost, or all
    /// Active sessions at max inflight) is an error instead.
    pub fn can_serve(&self, n: usize) -> Result<bool, BrokerError> {
        let stats = self.stats();
        if pool_exhausted(&stats) {
            return Err(BrokerError::PoolExhausted);
        }
        let quorum = (stats.total * 9).div_ceil(10);
        Ok(stats.capacity >= n && stats.active >= quorum)
    }

    /// Grow the pool to `n` sessions (never shrinks, capped at `pool.max`).
    pub fn force_scale(self: &Arc<Self>, n: usize) -> usize {
        let target = n.min(self.pool_cfg.max);
        let mut added = 0;
        while self.sessions.read().expect("sessions lock").len() < target {
            self.spawn_session();
            added += 1;
        }
        if added > 0 {
            tracing::info!("broker pool scaled up by {added} to {target}");
        }
        added
    }

    /// Auto-scale check against an estimate of currently reporting devices.
    pub fn ensure_capacity(self: &Arc<Self>, device_estimate: usize) -> usize {
        let stats = self.stats();
        let capacity = stats.total * self.pool_cfg.devices_per_session;
        if capacity == 0 {
            return self.force_scale(self.pool_cfg.initial.max(1));
        }
        let utilization = device_estimate * 100 / capacity;
        if utilization > self.pool_cfg.scale_threshold_pct as usize {
            let target = target_sessions(device_estimate, self.pool_cfg.devices_per_session);
            return self.force_scale(target.max(stats.total + 1));
        }
        0
    }

    /// Spawn the periodic auto-scale monitor.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        device_estimate: impl Fn() -> usize + Send + 'static,
        mut shutdown: ShutdownSignal,
    ) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let estimate = device_estimate();
                        pool.ensure_capacity(estimate);
                        let stats = pool.stats();
                        if pool_exhausted(&stats) {
                            tracing::error!(
                                "broker pool exhausted: {} lost, {} of {} active at max inflight",
                                stats.lost,
                                stats.saturated,
                                stats.active
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Wait for every session task to finish draining.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        tokio::time::timeout(deadline, join_all).await.is_ok()
    }
}

fn classify_connection_error(e: &rumqttc::ConnectionError) -> BrokerError {
    use rumqttc::ConnectionError;
    match e {
        ConnectionError::ConnectionRefused(code) => {
            // Broker NACKed the CONNECT; bad credentials are terminal.
            let text = format!("{code:?}");
            if text.contains("BadUserNamePassword") || text.contains("NotAuthorized") {
                BrokerError::AuthFailed
            } else {
                BrokerError::BrokerUnavailable(text)
            }
        }
        ConnectionError::Io(e) => BrokerError::BrokerUnavailable(e.to_string()),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            BrokerError::ConnectionLost
        }
        other => BrokerError::BrokerUnavailable(other.to_string()),
    }
}

/// Accepts `mqtt://host:port`, `tcp://host:port` or bare `host:port`.
fn parse_broker_url(url: &str) -> Result<(String, u16), BrokerError> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let (host, port) = match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| BrokerError::BrokerUnavailable(format!("bad port in {url}")))?;
            (host.to_string(), port)
        }
        None => (stripped.to_string(), 1883),
    };
    if host.is_empty() {
        return Err(BrokerError::BrokerUnavailable(format!("bad broker url {url}")));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_sizing_adds_headroom() {
        assert_eq!(target_sessions(500, 15), 36); // ceil(500/15)=34, +2
        assert_eq!(target_sessions(5000, 15), 336);
        assert_eq!(target_sessions(1, 15), 3);
        assert_eq!(target_sessions(0, 15), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_base(0), Duration::from_secs(1));
        assert_eq!(backoff_base(1), Duration::from_secs(2));
        assert_eq!(backoff_base(2), Duration::from_secs(4));
        assert_eq!(backoff_base(5), Duration::from_secs(32));
        assert_eq!(backoff_base(6), Duration::from_secs(60));
        assert_eq!(backoff_base(20), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for attempt in 0..8 {
            let base = backoff_base(attempt);
            for _ in 0..50 {
                let jittered = backoff_with_jitter(attempt);
                assert!(jittered >= base.mul_f64(0.8));
                assert!(jittered <= base.mul_f64(1.2));
            }
        }
    }

    fn stats_with(total: usize, active: usize, lost: usize, saturated: usize) -> PoolStats {
        PoolStats {
            total,
            active,
            connecting: total - active - lost,
            draining: 0,
            lost,
            messages_total: 0,
            inflight: 0,
            saturated,
            capacity: active * 15,
        }
    }

    #[test]
    fn exhaustion_covers_both_halves_of_the_contract() {
        // Every session lost.
        assert!(pool_exhausted(&stats_with(4, 0, 4, 0)));
        // Every active session at max inflight.
        assert!(pool_exhausted(&stats_with(4, 3, 1, 3)));

        // Healthy mixes are not exhausted.
        assert!(!pool_exhausted(&stats_with(4, 3, 1, 2)));
        assert!(!pool_exhausted(&stats_with(4, 4, 0, 0)));
        // Reconnecting-but-not-lost is not exhaustion.
        assert!(!pool_exhausted(&stats_with(4, 0, 2, 0)));
        // An empty pool reports nothing rather than exhaustion.
        assert!(!pool_exhausted(&stats_with(0, 0, 0, 0)));
    }

    #[test]
    fn broker_url_forms() {
        assert_eq!(
            parse_broker_url("mqtt://broker.example:1883").unwrap(),
            ("broker.example".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.5:8883").unwrap(),
            ("10.0.0.5".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(parse_broker_url("mqtt://:1883").is_err());
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
    }
}
