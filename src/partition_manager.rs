use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::PartitionConfig;
use crate::error::PartitionError;
use crate::store::Store;

const PARENT_TABLE: &str = "location_history";
const MAX_SUFFIX: char = 'z';

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^p_\d{6}(?:_[a-z])?$").expect("partition name regex"))
}

/// A validated partition name: `p_YYYYMM` or `p_YYYYMM_x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionName {
    pub year: i32,
    pub month: u32,
    pub suffix: Option<char>,
}

impl PartitionName {
    pub fn parse(name: &str) -> Result<Self, PartitionError> {
        if !name_regex().is_match(name) {
            return Err(PartitionError::InvalidName(name.to_string()));
        }
        let digits = &name[2..8];
        let year: i32 = digits[..4].parse().expect("regex guarantees digits");
        let month: u32 = digits[4..].parse().expect("regex guarantees digits");
        if !(1..=12).contains(&month) {
            return Err(PartitionError::InvalidName(name.to_string()));
        }
        let suffix = name.as_bytes().get(9).map(|b| *b as char);
        Ok(Self { year, month, suffix })
    }

    pub fn base(year: i32, month: u32) -> Self {
        Self { year, month, suffix: None }
    }

    pub fn with_suffix(&self, suffix: char) -> Self {
        Self { suffix: Some(suffix), ..*self }
    }

    pub fn month_index(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    /// Calendar range of the whole month. A sub-partition's actual range is
    /// narrower and comes from the catalog.
    pub fn month_range(&self) -> (NaiveDateTime, NaiveDateTime) {
        (
            month_start(self.year, self.month),
            next_month_start(self.year, self.month),
        )
    }
}

impl std::fmt::Display for PartitionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p_{:04}{:02}", self.year, self.month)?;
        if let Some(s) = self.suffix {
            write!(f, "_{s}")?;
        }
        Ok(())
    }
}

pub fn month_start(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
}

pub fn next_month_start(year: i32, month: u32) -> NaiveDateTime {
    let (y, m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    month_start(y, m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeAction {
    /// ≥ emergency: split immediately.
    SplitNow,
    /// ≥ critical: split when auto-split is enabled.
    SplitIfAuto,
    /// ≥ warning: watch and log.
    Monitor,
    NoAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub name: String,
    pub range_start: NaiveDateTime,
    pub range_end: NaiveDateTime,
    pub size_bytes: u64,
    pub size_mb: u64,
    pub row_estimate: i64,
    pub health: HealthLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub original: String,
    pub renamed_to: String,
    pub created: String,
    pub boundary: NaiveDateTime,
    pub rows_before: i64,
    pub rows_after: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub cutoff: String,
    pub executed: bool,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceAction {
    pub partition: String,
    pub action: SizeAction,
    pub split: Option<SplitReport>,
}

/// Lifecycle owner of the monthly range partitions of `location_history`.
pub struct PartitionManager {
    store: Store,
    cfg: PartitionConfig,
    /// Months known to be covered by at least one attached partition.
    covered_months: Mutex<HashSet<i64>>,
}

impl PartitionManager {
    pub fn new(store: Store, cfg: PartitionConfig) -> Self {
        Self {
            store,
            cfg,
            covered_months: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.cfg
    }

    pub fn decide(&self, size_bytes: u64) -> SizeAction {
        let mb = size_bytes / (1024 * 1024);
        if mb >= self.cfg.emergency_mb {
            SizeAction::SplitNow
        } else if mb >= self.cfg.critical_mb {
            SizeAction::SplitIfAuto
        } else if mb >= self.cfg.warning_mb {
            SizeAction::Monitor
        } else {
            SizeAction::NoAction
        }
    }

    pub fn health_for(&self, size_bytes: u64) -> HealthLevel {
        match self.decide(size_bytes) {
            SizeAction::SplitNow => HealthLevel::Critical,
            SizeAction::SplitIfAuto => HealthLevel::High,
            SizeAction::Monitor => HealthLevel::Medium,
            SizeAction::NoAction => HealthLevel::Low,
        }
    }

    pub async fn list(&self) -> Result<Vec<PartitionInfo>, PartitionError> {
        let rows = self
            .store
            .list_history_partitions()
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;

        let mut infos = Vec::with_capacity(rows.len());
        for row in rows {
            let name = PartitionName::parse(&row.name)?;
            let (start, end) = match row.bounds.as_deref().and_then(parse_bounds) {
                Some(range) => range,
                None => name.month_range(),
            };
            let size_bytes = row.size_bytes.max(0) as u64;
            infos.push(PartitionInfo {
                name: name.to_string(),
                range_start: start,
                range_end: end,
                size_bytes,
                size_mb: size_bytes / (1024 * 1024),
                row_estimate: row.row_estimate,
                health: self.health_for(size_bytes),
            });
        }
        Ok(infos)
    }

    pub async fn info(&self, name: &str) -> Result<PartitionInfo, PartitionError> {
        let parsed = PartitionName::parse(name)?;
        self.list()
            .await?
            .into_iter()
            .find(|p| p.name == parsed.to_string())
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))
    }

    /// Exact metrics are a table scan; the list endpoint serves estimates.
    pub async fn metrics(&self, name: &str) -> Result<serde_json::Value, PartitionError> {
        let info = self.info(name).await?;
        let rows = self
            .store
            .relation_row_count(&info.name)
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;
        Ok(serde_json::json!({
            "name": info.name,
            "range_start": info.range_start,
            "range_end": info.range_end,
            "size_bytes": info.size_bytes,
            "size_mb": info.size_mb,
            "rows": rows,
            "row_estimate": info.row_estimate,
            "health": info.health,
        }))
    }

    /// Create the base partition for a month unless the month is already
    /// covered (by the base or by sub-partitions). Idempotent.
    pub async fn ensure_month(&self, year: i32, month: u32) -> Result<Option<String>, PartitionError> {
        let name = PartitionName::base(year, month);
        {
            let covered = self.covered_months.lock().expect("covered lock");
            if covered.contains(&name.month_index()) {
                return Ok(None);
            }
        }

        if self.month_covered(&name).await? {
            self.mark_covered(&name);
            return Ok(None);
        }

        let (start, end) = name.month_range();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF {PARENT_TABLE} \
             FOR VALUES FROM ('{start}') TO ('{end}')",
        );
        self.store
            .execute_ddl(&sql)
            .await
            .map_err(|e| PartitionError::CreationFailed(format!("{name}: {e}")))?;
        tracing::info!("partition created: {name} [{start} .. {end})");
        self.mark_covered(&name);
        Ok(Some(name.to_string()))
    }

    /// Explicit admin creation; unlike `ensure_month` an existing cover is
    /// an error so the caller learns nothing happened.
    pub async fn create_month(&self, year: i32, month: u32) -> Result<String, PartitionError> {
        let name = PartitionName::base(year, month);
        if self.month_covered(&name).await? {
            return Err(PartitionError::AlreadyExists(name.to_string()));
        }
        self.ensure_month(year, month).await?;
        Ok(name.to_string())
    }

    /// Hot-path hook for the batch writer: make sure the month containing
    /// `ts` has a partition before a flush targets it.
    pub async fn ensure_for(&self, ts: NaiveDateTime) -> Result<(), PartitionError> {
        self.ensure_month(ts.year(), ts.month()).await?;
        Ok(())
    }

    /// Daily duty: current month plus the configured lookahead.
    pub async fn ensure_current_and_future(&self) -> Result<Vec<String>, PartitionError> {
        let now = Utc::now().naive_utc();
        let mut created = Vec::new();
        let (mut year, mut month) = (now.year(), now.month());
        for _ in 0..=self.cfg.future_months {
            if let Some(name) = self.ensure_month(year, month).await? {
                created.push(name);
            }
            (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        }
        Ok(created)
    }

    /// Size sweep over all partitions; splits per the decision table.
    pub async fn maintenance(&self) -> Result<Vec<MaintenanceAction>, PartitionError> {
        let mut actions = Vec::new();
        for info in self.list().await? {
            let action = self.decide(info.size_bytes);
            let split = match action {
                SizeAction::SplitNow => Some(self.split(&info.name).await?),
                SizeAction::SplitIfAuto if self.cfg.auto_split => {
                    Some(self.split(&info.name).await?)
                }
                SizeAction::SplitIfAuto => {
                    tracing::warn!(
                        "partition {} at {} MB exceeds critical but auto-split is off",
                        info.name,
                        info.size_mb
                    );
                    None
                }
                SizeAction::Monitor => {
                    tracing::info!("partition {} at {} MB, monitoring", info.name, info.size_mb);
                    None
                }
                SizeAction::NoAction => None,
            };
            if action != SizeAction::NoAction {
                actions.push(MaintenanceAction {
                    partition: info.name,
                    action,
                    split,
                });
            }
        }
        Ok(actions)
    }

    /// Split an oversized partition.
    ///
    /// The boundary is just past the newest stored row, so the existing
    /// relation keeps every row it has (re-attached with a narrowed range)
    /// and the new next-letter partition takes writes from the boundary to
    /// the end of the original range. An unsuffixed partition is renamed to
    /// `_a` first. Row counts are compared before and after.
    pub async fn split(&self, name: &str) -> Result<SplitReport, PartitionError> {
        let parsed = PartitionName::parse(name)?;
        let info = self.info(name).await?;

        let rows_before = self
            .store
            .relation_row_count(&info.name)
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;

        let max_ts = self
            .store
            .relation_max_recorded_at(&info.name)
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?
            .ok_or_else(|| {
                PartitionError::InfoError(format!("{name} is empty, nothing to split"))
            })?;

        let boundary = max_ts + chrono::Duration::seconds(1);
        if boundary >= info.range_end {
            return Err(PartitionError::InfoError(format!(
                "{name} has rows up to its range end, no room to split"
            )));
        }

        let siblings = self.month_partitions(&parsed).await?;
        let next = next_suffix(&siblings)
            .ok_or_else(|| PartitionError::CreationFailed(format!(
                "{name}: month already has {MAX_SUFFIX} sub-partitions"
            )))?;

        let renamed = parsed.with_suffix(parsed.suffix.unwrap_or('a'));
        let created = PartitionName {
            suffix: Some(next),
            ..parsed
        };

        let mut ddl = String::new();
        ddl.push_str("BEGIN;\n");
        ddl.push_str(&format!(
            "ALTER TABLE {PARENT_TABLE} DETACH PARTITION {};\n",
            info.name
        ));
        if parsed.suffix.is_none() {
            ddl.push_str(&format!("ALTER TABLE {} RENAME TO {renamed};\n", info.name));
        }
        ddl.push_str(&format!(
            "ALTER TABLE {PARENT_TABLE} ATTACH PARTITION {renamed} \
             FOR VALUES FROM ('{}') TO ('{boundary}');\n",
            info.range_start
        ));
        ddl.push_str(&format!(
            "CREATE TABLE {created} PARTITION OF {PARENT_TABLE} \
             FOR VALUES FROM ('{boundary}') TO ('{}');\n",
            info.range_end
        ));
        ddl.push_str("COMMIT;");

        self.store
            .execute_ddl(&ddl)
            .await
            .map_err(|e| PartitionError::CreationFailed(format!("split {name}: {e}")))?;

        let rows_after = self
            .store
            .relation_row_count(&renamed.to_string())
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;
        if rows_after != rows_before {
            return Err(PartitionError::CreationFailed(format!(
                "split {name}: row count changed {rows_before} -> {rows_after}"
            )));
        }

        tracing::warn!(
            "partition {name} split at {boundary}: {renamed} keeps {rows_before} rows, {created} takes new writes"
        );
        Ok(SplitReport {
            original: name.to_string(),
            renamed_to: renamed.to_string(),
            created: created.to_string(),
            boundary,
            rows_before,
            rows_after,
        })
    }

    pub async fn drop_partition(&self, name: &str, force: bool) -> Result<(), PartitionError> {
        let parsed = PartitionName::parse(name)?;
        if !self
            .store
            .relation_exists(name)
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?
        {
            return Err(PartitionError::NotFound(name.to_string()));
        }
        if !force && parsed.month_index() >= self.retention_cutoff_index() {
            return Err(PartitionError::TooRecent(name.to_string()));
        }

        self.store
            .execute_ddl(&format!("DROP TABLE {name}"))
            .await
            .map_err(|e| PartitionError::DropFailed(format!("{name}: {e}")))?;
        self.covered_months
            .lock()
            .expect("covered lock")
            .remove(&parsed.month_index());
        tracing::warn!("partition dropped: {name}");
        Ok(())
    }

    /// Drop partitions older than the retention window. With
    /// `execute = false` this is a dry run reporting what would go.
    pub async fn cleanup(
        &self,
        retention_months: Option<u32>,
        execute: bool,
    ) -> Result<CleanupReport, PartitionError> {
        let retention = retention_months.unwrap_or(self.cfg.retention_months);
        let cutoff = retention_cutoff(Utc::now().naive_utc(), retention);

        let mut dropped = Vec::new();
        for info in self.list().await? {
            let parsed = PartitionName::parse(&info.name)?;
            if parsed.month_index() < cutoff {
                if execute {
                    self.drop_partition(&info.name, true).await?;
                }
                dropped.push(info.name);
            }
        }
        let cutoff_name = PartitionName::base((cutoff / 12) as i32, (cutoff % 12 + 1) as u32);
        Ok(CleanupReport {
            cutoff: cutoff_name.to_string(),
            executed: execute,
            dropped,
        })
    }

    pub async fn analyze(&self, name: &str) -> Result<(), PartitionError> {
        let parsed = PartitionName::parse(name)?;
        self.require_exists(&parsed).await?;
        self.store
            .execute_ddl(&format!("ANALYZE {parsed}"))
            .await
            .map_err(|e| PartitionError::InfoError(format!("analyze {parsed}: {e}")))
    }

    pub async fn optimize(&self, name: &str) -> Result<(), PartitionError> {
        let parsed = PartitionName::parse(name)?;
        self.require_exists(&parsed).await?;
        self.store
            .execute_ddl(&format!("VACUUM (ANALYZE) {parsed}"))
            .await
            .map_err(|e| PartitionError::InfoError(format!("vacuum {parsed}: {e}")))
    }

    /// Weekly duty: refresh planner stats on the partitions still taking
    /// writes (current and previous month).
    pub async fn analyze_recent(&self) -> Result<Vec<String>, PartitionError> {
        let now = Utc::now().naive_utc();
        let current = PartitionName::base(now.year(), now.month()).month_index();
        let mut analyzed = Vec::new();
        for info in self.list().await? {
            let parsed = PartitionName::parse(&info.name)?;
            if current - parsed.month_index() <= 1 {
                self.analyze(&info.name).await?;
                analyzed.push(info.name);
            }
        }
        Ok(analyzed)
    }

    fn retention_cutoff_index(&self) -> i64 {
        retention_cutoff(Utc::now().naive_utc(), self.cfg.retention_months)
    }

    async fn require_exists(&self, name: &PartitionName) -> Result<(), PartitionError> {
        let exists = self
            .store
            .relation_exists(&name.to_string())
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;
        if exists {
            Ok(())
        } else {
            Err(PartitionError::NotFound(name.to_string()))
        }
    }

    async fn month_covered(&self, name: &PartitionName) -> Result<bool, PartitionError> {
        Ok(!self.month_partitions(name).await?.is_empty())
    }

    async fn month_partitions(
        &self,
        name: &PartitionName,
    ) -> Result<Vec<PartitionName>, PartitionError> {
        let rows = self
            .store
            .list_history_partitions()
            .await
            .map_err(|e| PartitionError::InfoError(e.to_string()))?;
        let mut siblings = Vec::new();
        for row in rows {
            let parsed = PartitionName::parse(&row.name)?;
            if parsed.year == name.year && parsed.month == name.month {
                siblings.push(parsed);
            }
        }
        Ok(siblings)
    }

    fn mark_covered(&self, name: &PartitionName) {
        self.covered_months
            .lock()
            .expect("covered lock")
            .insert(name.month_index());
    }
}

/// Month index of the newest partition the retention window still keeps;
/// anything strictly older gets dropped by cleanup.
fn retention_cutoff(now: NaiveDateTime, retention_months: u32) -> i64 {
    now.year() as i64 * 12 + (now.month() as i64 - 1) - retention_months as i64
}

/// Next free sub-partition letter for a month, given its current
/// partitions. An unsuffixed base counts as `_a` (it gets renamed during
/// the split).
fn next_suffix(siblings: &[PartitionName]) -> Option<char> {
    let highest = siblings
        .iter()
        .map(|p| p.suffix.unwrap_or('a'))
        .max()
        .unwrap_or('a');
    if highest >= MAX_SUFFIX {
        return None;
    }
    Some((highest as u8 + 1) as char)
}

/// Parse `FOR VALUES FROM ('…') TO ('…')` out of `pg_get_expr`.
fn parse_bounds(expr: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"FROM \('([^']+)'\) TO \('([^']+)'\)").expect("bounds regex")
    });
    let caps = re.captures(expr)?;
    Some((parse_pg_timestamp(&caps[1])?, parse_pg_timestamp(&caps[2])?))
}

fn parse_pg_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PartitionConfig {
        PartitionConfig::default()
    }

    fn mb(n: u64) -> u64 {
        n * 1024 * 1024
    }

    #[test]
    fn parses_base_and_suffixed_names() {
        let p = PartitionName::parse("p_202507").unwrap();
        assert_eq!((p.year, p.month, p.suffix), (2025, 7, None));
        assert_eq!(p.to_string(), "p_202507");

        let s = PartitionName::parse("p_202507_b").unwrap();
        assert_eq!(s.suffix, Some('b'));
        assert_eq!(s.to_string(), "p_202507_b");
    }

    #[test]
    fn rejects_bad_names_before_any_ddl() {
        for bad in [
            "p_2025",
            "p_202513",
            "p_202500",
            "p_202507_A",
            "p_202507_ab",
            "history; DROP TABLE vehicles",
            "p_202507;--",
        ] {
            assert!(
                matches!(PartitionName::parse(bad), Err(PartitionError::InvalidName(_))),
                "accepted bad name {bad}"
            );
        }
    }

    #[test]
    fn month_range_covers_the_calendar_month() {
        let p = PartitionName::parse("p_202507").unwrap();
        let (start, end) = p.month_range();
        assert_eq!(start.to_string(), "2025-07-01 00:00:00");
        assert_eq!(end.to_string(), "2025-08-01 00:00:00");

        let dec = PartitionName::parse("p_202512").unwrap();
        let (_, end) = dec.month_range();
        assert_eq!(end.to_string(), "2026-01-01 00:00:00");
    }

    #[tokio::test]
    async fn decision_table_matches_thresholds() {
        let store_less = PartitionManager::new_for_tests(cfg());
        assert_eq!(store_less.decide(mb(100)), SizeAction::NoAction);
        assert_eq!(store_less.decide(mb(750)), SizeAction::Monitor);
        assert_eq!(store_less.decide(mb(999)), SizeAction::Monitor);
        assert_eq!(store_less.decide(mb(1000)), SizeAction::SplitIfAuto);
        assert_eq!(store_less.decide(mb(1400)), SizeAction::SplitNow);
        assert_eq!(store_less.decide(mb(5000)), SizeAction::SplitNow);
    }

    #[tokio::test]
    async fn health_tracks_decision() {
        let m = PartitionManager::new_for_tests(cfg());
        assert_eq!(m.health_for(mb(10)), HealthLevel::Low);
        assert_eq!(m.health_for(mb(800)), HealthLevel::Medium);
        assert_eq!(m.health_for(mb(1100)), HealthLevel::High);
        assert_eq!(m.health_for(mb(1500)), HealthLevel::Critical);
    }

    #[test]
    fn next_suffix_walks_the_alphabet() {
        let base = PartitionName::parse("p_202507").unwrap();
        assert_eq!(next_suffix(&[base.clone()]), Some('b'));

        let a = base.with_suffix('a');
        let b = base.with_suffix('b');
        assert_eq!(next_suffix(&[a.clone(), b.clone()]), Some('c'));

        let z = base.with_suffix('z');
        assert_eq!(next_suffix(&[a, b, z]), None);
    }

    #[test]
    fn bounds_expr_round_trips() {
        let (start, end) = parse_bounds(
            "FOR VALUES FROM ('2025-07-01 00:00:00') TO ('2025-08-01 00:00:00')",
        )
        .unwrap();
        assert_eq!(start.to_string(), "2025-07-01 00:00:00");
        assert_eq!(end.to_string(), "2025-08-01 00:00:00");
        assert!(parse_bounds("DEFAULT").is_none());
    }

    #[test]
    fn retention_keeps_twelve_months() {
        // Current month 2025-07 with 12-month retention: p_202406 and
        // older go, p_202407 and newer stay.
        let now = month_start(2025, 7);
        let cutoff = retention_cutoff(now, 12);
        let dropped = PartitionName::parse("p_202406").unwrap();
        let kept = PartitionName::parse("p_202407").unwrap();
        let current = PartitionName::parse("p_202507").unwrap();
        assert!(dropped.month_index() < cutoff);
        assert!(kept.month_index() >= cutoff);
        assert!(current.month_index() >= cutoff);
    }

    #[test]
    fn month_index_orders_partitions() {
        let a = PartitionName::parse("p_202406").unwrap();
        let b = PartitionName::parse("p_202407").unwrap();
        let c = PartitionName::parse("p_202507").unwrap();
        assert!(a.month_index() < b.month_index());
        assert_eq!(c.month_index() - b.month_index(), 12);
    }

    impl PartitionManager {
        /// Decision-layer tests never touch the store; the pool is lazy and
        /// unconnected.
        fn new_for_tests(cfg: PartitionConfig) -> Self {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool");
            PartitionManager::new(Store::from_pool(pool), cfg)
        }
    }
}
