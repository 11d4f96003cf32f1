use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use serde::Serialize;

use crate::batch_writer::BatchWriter;
use crate::broadcast::{BroadcastHub, Topic};
use crate::broker_pool::BrokerPool;
use crate::location_cache::LocationCache;
use crate::metrics::Metrics;
use crate::partition_manager::PartitionManager;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DutyKind {
    Daily,
    Weekly,
    Cleanup,
    SessionSweep,
    StatsBroadcast,
}

/// When a duty runs. Cron-shaped but declarative; parsed from nothing at
/// runtime, the table below is the whole configuration.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum Schedule {
    DailyAt { hour: u32, minute: u32 },
    WeeklyAt { weekday: u8, hour: u32, minute: u32 },
    MonthlyAt { day: u32, hour: u32, minute: u32 },
    EverySecs(u64),
}

#[derive(Debug, Clone, Serialize)]
pub struct DutyRun {
    pub at: NaiveDateTime,
    pub success: bool,
    pub outcome: String,
}

struct Duty {
    name: &'static str,
    kind: DutyKind,
    schedule: Schedule,
    last: Mutex<Option<DutyRun>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DutyStatus {
    pub name: &'static str,
    pub schedule: Schedule,
    pub last_run: Option<DutyRun>,
}

/// Shared handles the duties operate on.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub partitions: Arc<PartitionManager>,
    pub hub: Arc<BroadcastHub>,
    pub pool: Arc<BrokerPool>,
    pub cache: Arc<LocationCache>,
    pub batch: BatchWriter,
    pub metrics: Arc<Metrics>,
}

/// Maintenance scheduler: partition upkeep, registry sweeps and the stats
/// feed, all from one table of duties, each manually triggerable through
/// the admin surface.
pub struct Scheduler {
    duties: Vec<Duty>,
    deps: SchedulerDeps,
    auto_cleanup: bool,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, sweep_interval_secs: u64, auto_cleanup: bool) -> Arc<Self> {
        let duties = vec![
            Duty {
                name: "daily",
                kind: DutyKind::Daily,
                schedule: Schedule::DailyAt { hour: 3, minute: 30 },
                last: Mutex::new(None),
            },
            Duty {
                name: "weekly",
                kind: DutyKind::Weekly,
                schedule: Schedule::WeeklyAt { weekday: 7, hour: 4, minute: 0 },
                last: Mutex::new(None),
            },
            Duty {
                name: "cleanup",
                kind: DutyKind::Cleanup,
                schedule: Schedule::MonthlyAt { day: 1, hour: 5, minute: 0 },
                last: Mutex::new(None),
            },
            Duty {
                name: "session-sweep",
                kind: DutyKind::SessionSweep,
                schedule: Schedule::EverySecs(sweep_interval_secs),
                last: Mutex::new(None),
            },
            Duty {
                name: "stats-broadcast",
                kind: DutyKind::StatsBroadcast,
                schedule: Schedule::EverySecs(30),
                last: Mutex::new(None),
            },
        ];
        Arc::new(Self {
            duties,
            deps,
            auto_cleanup,
        })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: ShutdownSignal) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            tracing::info!("scheduler started with {} duties", scheduler.duties.len());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now().naive_utc();
                        for duty in &scheduler.duties {
                            if scheduler.is_due(duty, now) {
                                scheduler.run_duty(duty, false).await;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("scheduler stopped");
                        break;
                    }
                }
            }
        });
    }

    fn is_due(&self, duty: &Duty, now: NaiveDateTime) -> bool {
        let last = duty.last.lock().expect("duty lock").clone();
        schedule_due(duty.schedule, last.as_ref(), now)
    }

    async fn run_duty(&self, duty: &Duty, confirm: bool) -> DutyRun {
        let (success, outcome) = match self.execute(duty.kind, confirm).await {
            Ok(outcome) => (true, outcome),
            Err(e) => {
                tracing::error!("duty {} failed: {e}", duty.name);
                (false, e)
            }
        };
        let run = DutyRun {
            at: Utc::now().naive_utc(),
            success,
            outcome,
        };
        *duty.last.lock().expect("duty lock") = Some(run.clone());
        run
    }

    async fn execute(&self, kind: DutyKind, confirm: bool) -> Result<String, String> {
        match kind {
            DutyKind::Daily => {
                let created = self
                    .deps
                    .partitions
                    .ensure_current_and_future()
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(if created.is_empty() {
                    "all partitions present".to_string()
                } else {
                    format!("created {}", created.join(", "))
                })
            }
            DutyKind::Weekly => {
                let analyzed = self
                    .deps
                    .partitions
                    .analyze_recent()
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("analyzed {} partitions", analyzed.len()))
            }
            DutyKind::Cleanup => {
                let execute = confirm || self.auto_cleanup;
                let report = self
                    .deps
                    .partitions
                    .cleanup(None, execute)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(if execute {
                    format!("dropped {} partitions", report.dropped.len())
                } else {
                    format!(
                        "dry run, {} partitions beyond retention: {}",
                        report.dropped.len(),
                        report.dropped.join(", ")
                    )
                })
            }
            DutyKind::SessionSweep => {
                let closed = self.deps.hub.sweep();
                Ok(format!("closed {closed} idle sessions"))
            }
            DutyKind::StatsBroadcast => {
                if self.deps.hub.subscriber_count(&Topic::Stats) == 0 {
                    return Ok("no subscribers".to_string());
                }
                let snapshot = self.full_snapshot();
                self.deps.hub.publish(&Topic::Stats, &snapshot.to_string());
                Ok("published".to_string())
            }
        }
    }

    /// Run one duty (or all of them) on demand from the admin surface.
    pub async fn trigger(&self, name: &str, confirm: bool) -> Option<Vec<(String, DutyRun)>> {
        let mut runs = Vec::new();
        for duty in &self.duties {
            if name == "all" || duty.name == name {
                let run = self.run_duty(duty, confirm).await;
                runs.push((duty.name.to_string(), run));
            }
        }
        (!runs.is_empty()).then_some(runs)
    }

    pub fn status(&self) -> Vec<DutyStatus> {
        self.duties
            .iter()
            .map(|d| DutyStatus {
                name: d.name,
                schedule: d.schedule,
                last_run: d.last.lock().expect("duty lock").clone(),
            })
            .collect()
    }

    pub fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "auto_cleanup": self.auto_cleanup,
            "duties": self.duties.iter().map(|d| {
                serde_json::json!({ "name": d.name, "schedule": d.schedule })
            }).collect::<Vec<_>>(),
        })
    }

    /// The whole system's gauge set in one JSON object.
    pub fn full_snapshot(&self) -> serde_json::Value {
        let pool = self.deps.pool.stats();
        let active_sessions = pool.active;
        let cache = self.deps.cache.stats();
        let counters = self.deps.metrics.snapshot();
        serde_json::json!({
            "timestamp": Utc::now().naive_utc(),
            "counters": counters,
            "queue": {
                "depth": self.deps.batch.depth(),
                "max": self.deps.batch.max_queue(),
            },
            "cache": cache,
            "broker": pool,
            "broker_sessions_active": active_sessions,
            "push": self.deps.hub.stats(),
        })
    }
}

fn schedule_due(schedule: Schedule, last: Option<&DutyRun>, now: NaiveDateTime) -> bool {
    match schedule {
        Schedule::EverySecs(secs) => match last {
            Some(run) => (now - run.at).num_seconds() >= secs as i64,
            None => true,
        },
        Schedule::DailyAt { hour, minute } => {
            past_time_of_day(now, hour, minute)
                && last.map(|r| r.at.date() < now.date()).unwrap_or(true)
        }
        Schedule::WeeklyAt { weekday, hour, minute } => {
            now.weekday().number_from_monday() as u8 == weekday
                && past_time_of_day(now, hour, minute)
                && last.map(|r| r.at.date() < now.date()).unwrap_or(true)
        }
        Schedule::MonthlyAt { day, hour, minute } => {
            now.day() == day
                && past_time_of_day(now, hour, minute)
                && last
                    .map(|r| (r.at.year(), r.at.month()) < (now.year(), now.month()))
                    .unwrap_or(true)
        }
    }
}

fn past_time_of_day(now: NaiveDateTime, hour: u32, minute: u32) -> bool {
    (now.hour(), now.minute()) >= (hour, minute)
}
