use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free pipeline counters. One instance is shared by every subsystem;
/// gauges that live elsewhere (queue depth, cache stats, pool state) are
/// pulled in when a [`MetricsSnapshot`] is assembled.
#[derive(Debug, Default)]
pub struct Metrics {
    pub messages_received: AtomicU64,
    pub messages_saved: AtomicU64,
    pub messages_failed: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub dedup_rejected: AtomicU64,
    pub samples_shed: AtomicU64,
    pub broadcasts_total: AtomicU64,
    pub broadcasts_role_scoped: AtomicU64,
    pub broadcasts_alert: AtomicU64,
    pub broadcast_errors: AtomicU64,
    pub broadcast_rate_limited: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dead_lettered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Save success rate over everything that reached the batch engine.
    /// 100% while nothing has been attempted yet.
    pub fn save_success_rate(&self) -> f64 {
        let saved = Self::get(&self.messages_saved);
        let failed = Self::get(&self.messages_failed);
        let total = saved + failed;
        if total == 0 {
            return 100.0;
        }
        saved as f64 * 100.0 / total as f64
    }
}

/// Point-in-time counter snapshot, published on `/topic/stats` and served
/// by the test surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_saved: u64,
    pub messages_failed: u64,
    pub messages_rejected: u64,
    pub dedup_rejected: u64,
    pub samples_shed: u64,
    pub broadcasts_total: u64,
    pub broadcasts_role_scoped: u64,
    pub broadcasts_alert: u64,
    pub broadcast_errors: u64,
    pub broadcast_rate_limited: u64,
    pub batches_flushed: u64,
    pub batches_dead_lettered: u64,
    pub save_success_rate: f64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: Self::get(&self.messages_received),
            messages_saved: Self::get(&self.messages_saved),
            messages_failed: Self::get(&self.messages_failed),
            messages_rejected: Self::get(&self.messages_rejected),
            dedup_rejected: Self::get(&self.dedup_rejected),
            samples_shed: Self::get(&self.samples_shed),
            broadcasts_total: Self::get(&self.broadcasts_total),
            broadcasts_role_scoped: Self::get(&self.broadcasts_role_scoped),
            broadcasts_alert: Self::get(&self.broadcasts_alert),
            broadcast_errors: Self::get(&self.broadcast_errors),
            broadcast_rate_limited: Self::get(&self.broadcast_rate_limited),
            batches_flushed: Self::get(&self.batches_flushed),
            batches_dead_lettered: Self::get(&self.batches_dead_lettered),
            save_success_rate: self.save_success_rate(),
        }
    }
}

/// Host-level readings for the health probes, from procfs. Absent values
/// (non-Linux hosts, unreadable files) leave the probe healthy rather than
/// failing it.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HostStats {
    pub mem_used_pct: Option<f64>,
    pub load_per_core: Option<f64>,
}

pub fn read_host_stats() -> HostStats {
    HostStats {
        mem_used_pct: read_mem_used_pct(),
        load_per_core: read_load_per_core(),
    }
}

fn read_mem_used_pct() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some((total - available) * 100.0 / total)
}

fn read_load_per_core() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute = loadavg.split_whitespace().next()?.parse::<f64>().ok()?;
    let cores = std::thread::available_parallelism().ok()?.get() as f64;
    Some(one_minute / cores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        Metrics::incr(&m.messages_received);
        Metrics::add(&m.messages_received, 4);
        assert_eq!(Metrics::get(&m.messages_received), 5);
    }

    #[test]
    fn success_rate_with_no_traffic_is_full() {
        let m = Metrics::new();
        assert_eq!(m.save_success_rate(), 100.0);
    }

    #[test]
    fn success_rate_reflects_failures() {
        let m = Metrics::new();
        Metrics::add(&m.messages_saved, 95);
        Metrics::add(&m.messages_failed, 5);
        let rate = m.save_success_rate();
        assert!((rate - 95.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_copies_counters() {
        let m = Metrics::new();
        Metrics::add(&m.broadcasts_total, 3);
        Metrics::incr(&m.broadcasts_alert);
        let snap = m.snapshot();
        assert_eq!(snap.broadcasts_total, 3);
        assert_eq!(snap.broadcasts_alert, 1);
        assert_eq!(snap.save_success_rate, 100.0);
    }
}
