use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::models::sample::LocationSample;

const SHARD_COUNT: usize = 16;

/// In-process map of the most recent sample per device.
///
/// A performance layer over the `last_location` table: eviction loses
/// nothing durable. Writes take one shard lock; reads touch the LRU under
/// the same lock but never cross shards. Updates are idempotent by
/// timestamp: only a strictly newer sample replaces the cached one.
pub struct LocationCache {
    shards: Vec<Mutex<Shard>>,
    per_shard_cap: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Default)]
struct Shard {
    map: HashMap<String, Entry>,
    lru: BTreeMap<u64, String>,
}

struct Entry {
    sample: LocationSample,
    touch: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_pct: f64,
}

impl LocationCache {
    pub fn new(max_entries: usize) -> Self {
        let per_shard_cap = (max_entries / SHARD_COUNT).max(1);
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            per_shard_cap,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, device_id: &str) -> &Mutex<Shard> {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Accept the sample iff it is strictly newer than the cached one.
    /// Returns true when the cache was updated; the caller then writes
    /// through to the durable row.
    pub fn update(&self, sample: &LocationSample) -> bool {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut shard = self.shard_for(&sample.device_id).lock().expect("cache lock");

        if let Some(entry) = shard.map.get_mut(&sample.device_id) {
            if sample.recorded_at <= entry.sample.recorded_at {
                return false;
            }
            entry.sample = sample.clone();
            let old = entry.touch;
            entry.touch = clock;
            shard.lru.remove(&old);
            shard.lru.insert(clock, sample.device_id.clone());
            return true;
        }

        shard.map.insert(
            sample.device_id.clone(),
            Entry {
                sample: sample.clone(),
                touch: clock,
            },
        );
        shard.lru.insert(clock, sample.device_id.clone());

        if shard.map.len() > self.per_shard_cap {
            if let Some((&oldest, _)) = shard.lru.iter().next() {
                if let Some(victim) = shard.lru.remove(&oldest) {
                    shard.map.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }

    pub fn get(&self, device_id: &str) -> Option<LocationSample> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut shard = self.shard_for(device_id).lock().expect("cache lock");
        match shard.map.get_mut(device_id) {
            Some(entry) => {
                let old = entry.touch;
                entry.touch = clock;
                let sample = entry.sample.clone();
                shard.lru.remove(&old);
                shard.lru.insert(clock, device_id.to_string());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(sample)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache lock").map.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate_pct = if lookups == 0 {
            100.0
        } else {
            hits as f64 * 100.0 / lookups as f64
        };
        CacheStats {
            size: self.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate_pct,
        }
    }
}
