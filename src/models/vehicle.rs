use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use super::sample::OwnerRefs;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;

/// A fleet vehicle as registered by the external CRUD surface. The ingest
/// path only ever reads the `device_id` to owners projection.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Vehicle {
    pub id: i64,
    pub serial_no: String,
    pub imei: Option<String>,
    pub device_id: Option<String>,
    pub installation_date: Option<NaiveDate>,
    pub renewal_date: Option<NaiveDate>,
    pub dealer_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub client_id: Option<i64>,
    pub user_id: Option<i64>,
    pub superadmin_id: Option<i64>,
}

impl Vehicle {
    pub fn owners(&self) -> OwnerRefs {
        OwnerRefs {
            dealer_id: self.dealer_id,
            admin_id: self.admin_id,
            client_id: self.client_id,
            user_id: self.user_id,
            superadmin_id: self.superadmin_id,
        }
    }
}

/// Read-mostly lookup map from device id to owner refs.
///
/// Refreshes swap the whole `Arc` so readers never block on a refresh;
/// lookups clone a small struct out of the current snapshot.
pub struct VehicleDirectory {
    inner: RwLock<Arc<HashMap<String, OwnerRefs>>>,
}

impl VehicleDirectory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn lookup(&self, device_id: &str) -> Option<OwnerRefs> {
        let snapshot = self.inner.read().expect("directory lock poisoned");
        snapshot.get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("directory lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn replace(&self, map: HashMap<String, OwnerRefs>) {
        let mut guard = self.inner.write().expect("directory lock poisoned");
        *guard = Arc::new(map);
    }
}

impl Default for VehicleDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic refresh of the directory from the vehicle table.
pub fn spawn_directory_refresh(
    directory: Arc<VehicleDirectory>,
    store: Store,
    interval_secs: u64,
    mut shutdown: ShutdownSignal,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(5)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.load_vehicle_owners().await {
                        Ok(map) => {
                            tracing::debug!("vehicle directory refreshed: {} devices", map.len());
                            directory.replace(map);
                        }
                        Err(e) => tracing::warn!("vehicle directory refresh failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("vehicle directory refresh stopped");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hits_and_misses() {
        let dir = VehicleDirectory::new();
        assert!(dir.lookup("D1").is_none());

        let mut map = HashMap::new();
        map.insert(
            "D1".to_string(),
            OwnerRefs {
                dealer_id: Some(7),
                user_id: Some(42),
                ..Default::default()
            },
        );
        dir.replace(map);

        let owners = dir.lookup("D1").unwrap();
        assert_eq!(owners.dealer_id, Some(7));
        assert_eq!(owners.user_id, Some(42));
        assert_eq!(owners.client_id, None);
        assert!(dir.lookup("D2").is_none());
    }

    #[test]
    fn replace_swaps_snapshot() {
        let dir = VehicleDirectory::new();
        let mut first = HashMap::new();
        first.insert("D1".to_string(), OwnerRefs::default());
        dir.replace(first);
        assert_eq!(dir.len(), 1);

        dir.replace(HashMap::new());
        assert!(dir.is_empty());
    }
}
