use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime};

/// Recent (timestamp, sequence) pairs kept per device.
const DEVICE_WINDOW: usize = 64;

/// Duplicate and stale-sample gate.
///
/// Each device keeps a bounded window of recently accepted
/// (timestamp, sequence) pairs. A sample is rejected when the exact pair was
/// already accepted, or when its timestamp lags the newest accepted one by
/// more than the configured skew. A timestamp tie with a *different*
/// sequence number passes through; the upsert downstream decides the winner
/// field by field.
///
/// Devices themselves are bounded by an LRU so a fleet churn can't grow the
/// map without limit.
pub struct Fingerprint {
    inner: Mutex<Inner>,
    max_devices: usize,
    skew: Duration,
}

struct Inner {
    devices: HashMap<String, DeviceWindow>,
    /// Maps touch counter to device id, oldest first.
    lru: BTreeMap<u64, String>,
    clock: u64,
}

struct DeviceWindow {
    newest: NaiveDateTime,
    recent: VecDeque<(NaiveDateTime, Option<String>)>,
    touch: u64,
}

impl Fingerprint {
    pub fn new(max_devices: usize, skew_hours: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                lru: BTreeMap::new(),
                clock: 0,
            }),
            max_devices: max_devices.max(1),
            skew: Duration::hours(skew_hours),
        }
    }

    /// Returns true when the sample should proceed through the pipeline.
    pub fn accept(
        &self,
        device_id: &str,
        recorded_at: NaiveDateTime,
        sequence_no: Option<&str>,
    ) -> bool {
        let mut inner = self.inner.lock().expect("fingerprint lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(window) = inner.devices.get_mut(device_id) {
            if window
                .recent
                .iter()
                .any(|(ts, seq)| *ts == recorded_at && seq.as_deref() == sequence_no)
            {
                return false;
            }
            if recorded_at < window.newest - self.skew {
                return false;
            }

            window.recent.push_back((recorded_at, sequence_no.map(str::to_string)));
            if window.recent.len() > DEVICE_WINDOW {
                window.recent.pop_front();
            }
            if recorded_at > window.newest {
                window.newest = recorded_at;
            }
            let old_touch = window.touch;
            window.touch = clock;
            inner.lru.remove(&old_touch);
            inner.lru.insert(clock, device_id.to_string());
            return true;
        }

        // First sample for this device.
        let mut recent = VecDeque::with_capacity(8);
        recent.push_back((recorded_at, sequence_no.map(str::to_string)));
        inner.devices.insert(
            device_id.to_string(),
            DeviceWindow {
                newest: recorded_at,
                recent,
                touch: clock,
            },
        );
        inner.lru.insert(clock, device_id.to_string());

        if inner.devices.len() > self.max_devices {
            if let Some((&oldest, _)) = inner.lru.iter().next() {
                if let Some(evicted) = inner.lru.remove(&oldest) {
                    inner.devices.remove(&evicted);
                    tracing::debug!("fingerprint: evicted idle device {evicted}");
                }
            }
        }
        true
    }

    pub fn tracked_devices(&self) -> usize {
        self.inner.lock().expect("fingerprint lock poisoned").devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn exact_resubmission_is_rejected() {
        let fp = Fingerprint::new(1000, 24);
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), None));
        assert!(!fp.accept("D1", ts("2025-07-09 08:15:31"), None));
    }

    #[test]
    fn same_pair_with_sequence_is_rejected() {
        let fp = Fingerprint::new(1000, 24);
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), Some("17")));
        assert!(!fp.accept("D1", ts("2025-07-09 08:15:31"), Some("17")));
    }

    #[test]
    fn timestamp_tie_with_different_sequence_passes() {
        let fp = Fingerprint::new(1000, 24);
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), Some("17")));
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), Some("18")));
    }

    #[test]
    fn stale_beyond_skew_is_rejected() {
        let fp = Fingerprint::new(1000, 24);
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), None));
        // 25 hours behind the newest accepted sample.
        assert!(!fp.accept("D1", ts("2025-07-08 07:00:00"), None));
        // 23 hours behind is inside the skew.
        assert!(fp.accept("D1", ts("2025-07-08 09:15:31"), None));
    }

    #[test]
    fn devices_are_independent() {
        let fp = Fingerprint::new(1000, 24);
        assert!(fp.accept("D1", ts("2025-07-09 08:15:31"), None));
        assert!(fp.accept("D2", ts("2025-07-09 08:15:31"), None));
    }

    #[test]
    fn per_device_window_is_bounded() {
        let fp = Fingerprint::new(1000, 24);
        let base = ts("2025-07-09 00:00:00");
        for i in 0..(DEVICE_WINDOW as i64 + 10) {
            assert!(fp.accept("D1", base + Duration::seconds(i), None));
        }
        // The first pair has rolled out of the window; only the skew check
        // still applies, and one second back is well inside it.
        assert!(fp.accept("D1", base, None));
    }

    #[test]
    fn device_lru_evicts_oldest() {
        let fp = Fingerprint::new(2, 24);
        let t = ts("2025-07-09 08:00:00");
        assert!(fp.accept("D1", t, None));
        assert!(fp.accept("D2", t, None));
        assert!(fp.accept("D3", t, None));
        assert_eq!(fp.tracked_devices(), 2);
        // D1 was evicted, so its duplicate is no longer remembered.
        assert!(fp.accept("D1", t, None));
    }
}
