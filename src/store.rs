use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures_util::stream::{Stream, TryStreamExt};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;

use crate::config::DatabaseConfig;
use crate::error::PersistenceError;
use crate::models::sample::{LocationSample, OwnerRefs};

/// Keyset page size for the streaming history endpoints.
const STREAM_PAGE: usize = 1000;

/// All SQL lives here. The history table is `location_history`, partitioned
/// by RANGE on `recorded_at`; inserts go through the parent and Postgres
/// routes rows to the right partition.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

/// A stored history row; also the shape of `last_location` minus
/// `updated_at`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub device_id: String,
    pub recorded_at: NaiveDateTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<String>,
    pub ignition: Option<bool>,
    pub vehicle_status: Option<String>,
    pub gsm_strength: Option<String>,
    pub sequence_no: Option<String>,
    pub panic: bool,
    pub dealer_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub client_id: Option<i64>,
    pub user_id: Option<i64>,
    pub superadmin_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LastLocationRow {
    pub device_id: String,
    pub recorded_at: NaiveDateTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<String>,
    pub ignition: Option<bool>,
    pub vehicle_status: Option<String>,
    pub gsm_strength: Option<String>,
    pub sequence_no: Option<String>,
    pub panic: bool,
    pub dealer_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub client_id: Option<i64>,
    pub user_id: Option<i64>,
    pub superadmin_id: Option<i64>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryStats {
    pub count: i64,
    pub first_at: Option<NaiveDateTime>,
    pub last_at: Option<NaiveDateTime>,
    pub min_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub avg_speed: Option<f64>,
}

/// Raw partition catalog row from `pg_inherits`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PartitionCatalogRow {
    pub name: String,
    pub bounds: Option<String>,
    pub size_bytes: i64,
    pub row_estimate: i64,
}

const HISTORY_COLUMNS: &str = "device_id, recorded_at, latitude, longitude, speed, course, \
     ignition, vehicle_status, gsm_strength, sequence_no, panic, \
     dealer_id, admin_id, client_id, user_id, superadmin_id";

/// Columns merged field-by-field on conflict: a non-null incoming value
/// overwrites, a null one leaves the stored value intact.
const MERGE_COLUMNS: &[&str] = &[
    "latitude",
    "longitude",
    "speed",
    "course",
    "ignition",
    "vehicle_status",
    "gsm_strength",
    "sequence_no",
    "dealer_id",
    "admin_id",
    "client_id",
    "user_id",
    "superadmin_id",
];

fn merge_clause(table: &str) -> String {
    let mut parts: Vec<String> = MERGE_COLUMNS
        .iter()
        .map(|col| format!("{col} = COALESCE(EXCLUDED.{col}, {table}.{col})"))
        .collect();
    parts.push(format!("panic = EXCLUDED.panic OR {table}.panic"));
    parts.join(", ")
}

impl Store {
    pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
            .connect(&cfg.url)
            .await?;
        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        tracing::info!("datastore connected ({} max conns)", cfg.max_connections);
        Ok(Self { pool })
    }

    /// Wrap an existing pool (lazy pools in tests, shared pools in tools).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> (u32, usize) {
        (self.pool.size(), self.pool.num_idle())
    }

    /// Idempotent batch upsert on `(device_id, recorded_at)`.
    ///
    /// Callers must pre-merge duplicate keys inside one batch; Postgres
    /// refuses an `ON CONFLICT DO UPDATE` touching the same row twice.
    pub async fn upsert_history_batch(
        &self,
        rows: &[LocationSample],
    ) -> Result<u64, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO location_history ({HISTORY_COLUMNS}) "));
        qb.push_values(rows, |mut b, s| {
            b.push_bind(&s.device_id)
                .push_bind(s.recorded_at)
                .push_bind(s.latitude)
                .push_bind(s.longitude)
                .push_bind(s.speed)
                .push_bind(&s.course)
                .push_bind(s.ignition)
                .push_bind(&s.vehicle_status)
                .push_bind(&s.gsm_strength)
                .push_bind(&s.sequence_no)
                .push_bind(s.panic)
                .push_bind(s.owners.dealer_id)
                .push_bind(s.owners.admin_id)
                .push_bind(s.owners.client_id)
                .push_bind(s.owners.user_id)
                .push_bind(s.owners.superadmin_id);
        });
        qb.push(format!(
            " ON CONFLICT (device_id, recorded_at) DO UPDATE SET {}",
            merge_clause("location_history")
        ));

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Write-through for the last-location view. The guard keeps the stored
    /// row monotonic: an older sample never overwrites a newer one.
    pub async fn upsert_last_location(
        &self,
        s: &LocationSample,
    ) -> Result<(), PersistenceError> {
        let sql = format!(
            "INSERT INTO last_location ({HISTORY_COLUMNS}, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, now()) \
             ON CONFLICT (device_id) DO UPDATE SET \
             recorded_at = EXCLUDED.recorded_at, {}, updated_at = now() \
             WHERE EXCLUDED.recorded_at > last_location.recorded_at",
            merge_clause("last_location")
        );
        sqlx::query(&sql)
            .bind(&s.device_id)
            .bind(s.recorded_at)
            .bind(s.latitude)
            .bind(s.longitude)
            .bind(s.speed)
            .bind(&s.course)
            .bind(s.ignition)
            .bind(&s.vehicle_status)
            .bind(&s.gsm_strength)
            .bind(&s.sequence_no)
            .bind(s.panic)
            .bind(s.owners.dealer_id)
            .bind(s.owners.admin_id)
            .bind(s.owners.client_id)
            .bind(s.owners.user_id)
            .bind(s.owners.superadmin_id)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(())
    }

    pub async fn fetch_last_location(
        &self,
        device_id: &str,
    ) -> Result<Option<LastLocationRow>, PersistenceError> {
        sqlx::query_as::<_, LastLocationRow>(
            "SELECT * FROM last_location WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    pub async fn fetch_history(
        &self,
        device_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<HistoryRow>, PersistenceError> {
        sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM location_history \
             WHERE device_id = $1 AND recorded_at >= $2 AND recorded_at <= $3 \
             ORDER BY recorded_at LIMIT $4",
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    pub async fn count_history(
        &self,
        device_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<i64, PersistenceError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM location_history \
             WHERE device_id = $1 AND recorded_at >= $2 AND recorded_at <= $3",
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    pub async fn history_stats(
        &self,
        device_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<HistoryStats, PersistenceError> {
        sqlx::query_as::<_, HistoryStats>(
            "SELECT count(*) AS count, min(recorded_at) AS first_at, \
                    max(recorded_at) AS last_at, min(speed) AS min_speed, \
                    max(speed) AS max_speed, avg(speed) AS avg_speed \
             FROM location_history \
             WHERE device_id = $1 AND recorded_at >= $2 AND recorded_at <= $3",
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    /// Keyset-paginated stream over a device's history, ordered by
    /// timestamp. Each page is one bounded query, so the stream is `'static`
    /// and safe to hand to a response body.
    pub fn stream_history(
        &self,
        device_id: String,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> impl Stream<Item = Result<HistoryRow, PersistenceError>> + Send + 'static {
        let pool = self.pool.clone();
        futures_util::stream::try_unfold(Some(from), move |cursor| {
            let pool = pool.clone();
            let device_id = device_id.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let rows: Vec<HistoryRow> = sqlx::query_as(
                    "SELECT * FROM location_history \
                     WHERE device_id = $1 AND recorded_at >= $2 AND recorded_at <= $3 \
                     ORDER BY recorded_at LIMIT $4",
                )
                .bind(&device_id)
                .bind(after)
                .bind(to)
                .bind(STREAM_PAGE as i64)
                .fetch_all(&pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;

                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if rows.len() < STREAM_PAGE {
                    None
                } else {
                    rows.last()
                        .map(|r| r.recorded_at + chrono::Duration::microseconds(1))
                };
                let page =
                    futures_util::stream::iter(rows.into_iter().map(Ok::<_, PersistenceError>));
                Ok(Some((page, next)))
            }
        })
        .try_flatten()
    }

    pub async fn load_vehicle_owners(
        &self,
    ) -> Result<HashMap<String, OwnerRefs>, PersistenceError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            device_id: String,
            dealer_id: Option<i64>,
            admin_id: Option<i64>,
            client_id: Option<i64>,
            user_id: Option<i64>,
            superadmin_id: Option<i64>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            "SELECT device_id, dealer_id, admin_id, client_id, user_id, superadmin_id \
             FROM vehicles WHERE device_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.device_id,
                    OwnerRefs {
                        dealer_id: r.dealer_id,
                        admin_id: r.admin_id,
                        client_id: r.client_id,
                        user_id: r.user_id,
                        superadmin_id: r.superadmin_id,
                    },
                )
            })
            .collect())
    }

    // ── Partition catalog ──

    pub async fn list_history_partitions(
        &self,
    ) -> Result<Vec<PartitionCatalogRow>, PersistenceError> {
        sqlx::query_as::<_, PartitionCatalogRow>(
            "SELECT child.relname AS name, \
                    pg_get_expr(child.relpartbound, child.oid) AS bounds, \
                    pg_total_relation_size(child.oid) AS size_bytes, \
                    greatest(child.reltuples, 0)::bigint AS row_estimate \
             FROM pg_inherits \
             JOIN pg_class parent ON pg_inherits.inhparent = parent.oid \
             JOIN pg_class child ON pg_inherits.inhrelid = child.oid \
             WHERE parent.relname = 'location_history' \
             ORDER BY child.relname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    pub async fn relation_exists(&self, name: &str) -> Result<bool, PersistenceError> {
        sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)
    }

    /// Exact row count of one relation. Only called with regex-validated
    /// partition names.
    pub async fn relation_row_count(&self, name: &str) -> Result<i64, PersistenceError> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT count(*) FROM {name}"))
            .fetch_one(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)
    }

    pub async fn relation_max_recorded_at(
        &self,
        name: &str,
    ) -> Result<Option<NaiveDateTime>, PersistenceError> {
        sqlx::query_scalar::<_, Option<NaiveDateTime>>(&format!(
            "SELECT max(recorded_at) FROM {name}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)
    }

    /// DDL runs over the simple protocol; VACUUM and friends refuse the
    /// extended one.
    pub async fn execute_ddl(&self, sql: &str) -> Result<(), PersistenceError> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample::LocationSample;
    use chrono::NaiveDate;

    fn sample(device: &str) -> LocationSample {
        let recorded_at = NaiveDate::from_ymd_opt(2025, 7, 9)
            .unwrap()
            .and_hms_opt(8, 15, 31)
            .unwrap();
        LocationSample {
            latitude: Some(25.2),
            longitude: Some(55.3),
            speed: Some(40.0),
            ..LocationSample::new(device, recorded_at)
        }
    }

    #[test]
    fn merge_clause_coalesces_every_payload_column() {
        let clause = merge_clause("location_history");
        for col in MERGE_COLUMNS {
            assert!(
                clause.contains(&format!(
                    "{col} = COALESCE(EXCLUDED.{col}, location_history.{col})"
                )),
                "missing merge for {col}"
            );
        }
        // The key columns must never be rewritten by the merge.
        assert!(!clause.contains("device_id ="));
        assert!(!clause.contains("recorded_at ="));
    }

    #[test]
    fn batch_upsert_sql_targets_natural_key() {
        let rows = vec![sample("D1"), sample("D2")];
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO location_history ({HISTORY_COLUMNS}) "));
        qb.push_values(&rows, |mut b, s| {
            b.push_bind(&s.device_id).push_bind(s.recorded_at);
        });
        qb.push(format!(
            " ON CONFLICT (device_id, recorded_at) DO UPDATE SET {}",
            merge_clause("location_history")
        ));
        let sql = qb.sql();
        assert!(sql.contains("ON CONFLICT (device_id, recorded_at)"));
        assert!(sql.contains("latitude = COALESCE(EXCLUDED.latitude, location_history.latitude)"));
    }
}
