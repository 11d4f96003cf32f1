use crate::store::Store;

/// Ordered list of DDL statements to ensure the tracking schema exists.
/// Every statement is idempotent (`IF NOT EXISTS`) so safe to run on every
/// startup. Month partitions of `location_history` are NOT created here;
/// the partition manager owns their lifecycle.
const MIGRATIONS: &[&str] = &[
    // ── Vehicle directory (written by the external CRUD surface) ──
    r"CREATE TABLE IF NOT EXISTS vehicles
(
    id                BIGSERIAL PRIMARY KEY,
    serial_no         TEXT NOT NULL UNIQUE,
    imei              TEXT UNIQUE,
    device_id         TEXT UNIQUE,
    installation_date DATE,
    renewal_date      DATE,
    dealer_id         BIGINT,
    admin_id          BIGINT,
    client_id         BIGINT,
    user_id           BIGINT,
    superadmin_id     BIGINT
)",
    "CREATE INDEX IF NOT EXISTS idx_vehicles_dealer ON vehicles (dealer_id)",
    "CREATE INDEX IF NOT EXISTS idx_vehicles_client ON vehicles (client_id)",

    // ── History: month-partitioned time series ──
    // recorded_at is TIMESTAMP (no time zone): the device wall clock is
    // stored verbatim and the driver has nothing to reinterpret.
    r"CREATE TABLE IF NOT EXISTS location_history
(
    device_id      TEXT NOT NULL,
    recorded_at    TIMESTAMP NOT NULL,
    latitude       DOUBLE PRECISION,
    longitude      DOUBLE PRECISION,
    speed          DOUBLE PRECISION,
    course         TEXT,
    ignition       BOOLEAN,
    vehicle_status TEXT,
    gsm_strength   TEXT,
    sequence_no    TEXT,
    panic          BOOLEAN NOT NULL DEFAULT false,
    dealer_id      BIGINT,
    admin_id       BIGINT,
    client_id      BIGINT,
    user_id        BIGINT,
    superadmin_id  BIGINT,
    PRIMARY KEY (device_id, recorded_at)
) PARTITION BY RANGE (recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_history_dealer ON location_history (dealer_id, recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_history_client ON location_history (client_id, recorded_at)",

    // ── Last-location: one mutable row per device ──
    r"CREATE TABLE IF NOT EXISTS last_location
(
    device_id      TEXT PRIMARY KEY,
    recorded_at    TIMESTAMP NOT NULL,
    latitude       DOUBLE PRECISION,
    longitude      DOUBLE PRECISION,
    speed          DOUBLE PRECISION,
    course         TEXT,
    ignition       BOOLEAN,
    vehicle_status TEXT,
    gsm_strength   TEXT,
    sequence_no    TEXT,
    panic          BOOLEAN NOT NULL DEFAULT false,
    dealer_id      BIGINT,
    admin_id       BIGINT,
    client_id      BIGINT,
    user_id        BIGINT,
    superadmin_id  BIGINT,
    updated_at     TIMESTAMP NOT NULL DEFAULT now()
)",
];

/// Run every migration in order. Called once at startup before any engine
/// is spawned.
pub async fn run(store: &Store) -> anyhow::Result<()> {
    for (i, sql) in MIGRATIONS.iter().enumerate() {
        store
            .execute_ddl(sql)
            .await
            .map_err(|e| anyhow::anyhow!("migration {i} failed: {e}"))?;
    }
    tracing::info!("schema ensured ({} statements)", MIGRATIONS.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_idempotent() {
        for sql in MIGRATIONS {
            let upper = sql.to_uppercase();
            assert!(
                upper.contains("IF NOT EXISTS"),
                "non-idempotent migration: {}",
                &sql[..60.min(sql.len())]
            );
        }
    }

    #[test]
    fn history_is_partitioned_on_recorded_at() {
        let history = MIGRATIONS
            .iter()
            .find(|s| s.contains("location_history\n"))
            .unwrap();
        assert!(history.contains("PARTITION BY RANGE (recorded_at)"));
        assert!(history.contains("PRIMARY KEY (device_id, recorded_at)"));
        assert!(history.contains("recorded_at    TIMESTAMP NOT NULL"));
    }
}
