//! Cron-driven scheduling of import jobs.
//!
//! Each job with a cron expression gets its own timer loop. A firing that
//! finds the previous run of the same job still active is skipped, never
//! queued. Manual triggers share the same per-job guard and fail fast with
//! [`AppError::JobBusy`] instead.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::pipeline::{ImportParams, ImportPipeline};
use crate::sync::RunStats;
use crate::traits::{EntityStore, StateStore, UpstreamFetcher};

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate wants `sec min hour day-of-month month day-of-week`.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parses a 5- or 6-field crontab expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, AppError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| AppError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Next tick strictly after both `now` and the previous firing.
///
/// Keeping `last` in the comparison means a timer that wakes a hair early
/// cannot fire the same tick twice.
pub fn next_fire(
    schedule: &Schedule,
    now: DateTime<Utc>,
    last: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = match last {
        Some(last) if last > now => last,
        _ => now,
    };
    schedule.after(&from).next()
}

struct ScheduledJob {
    name: String,
    expr: String,
    schedule: Schedule,
}

/// Marks a job as running until dropped.
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Scheduler<F, S, K>
where
    F: UpstreamFetcher,
    S: EntityStore,
    K: StateStore,
{
    pipeline: Arc<ImportPipeline<F, S, K>>,
    jobs: Vec<ScheduledJob>,
    running: HashMap<String, Arc<AtomicBool>>,
    enabled: bool,
}

impl<F, S, K> Scheduler<F, S, K>
where
    F: UpstreamFetcher,
    S: EntityStore,
    K: StateStore,
{
    /// Builds a scheduler for every job of `pipeline`.
    ///
    /// Fails on the first unparsable cron expression. `enabled` is the
    /// master switch for timer-driven runs; manual triggers work either way.
    pub fn new(pipeline: Arc<ImportPipeline<F, S, K>>, enabled: bool) -> Result<Self, AppError> {
        let mut jobs = Vec::new();
        let mut running = HashMap::new();

        for job in pipeline.jobs() {
            running.insert(job.name.clone(), Arc::new(AtomicBool::new(false)));
            if let Some(expr) = &job.cron {
                jobs.push(ScheduledJob {
                    name: job.name.clone(),
                    expr: expr.clone(),
                    schedule: parse_cron(expr)?,
                });
            }
        }

        Ok(Self {
            pipeline,
            jobs,
            running,
            enabled,
        })
    }

    pub fn pipeline(&self) -> &Arc<ImportPipeline<F, S, K>> {
        &self.pipeline
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self, job: &str) -> bool {
        self.running
            .get(job)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Next firing time of every scheduled job.
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.jobs
            .iter()
            .map(|job| (job.name.clone(), next_fire(&job.schedule, now, None)))
            .collect()
    }

    /// Runs `job` now, outside its schedule.
    pub async fn trigger(&self, job: &str, params: &ImportParams) -> Result<RunStats, AppError> {
        self.pipeline.job(job)?;
        let _guard = self
            .claim(job)
            .ok_or_else(|| AppError::JobBusy(job.to_string()))?;
        self.pipeline.run_import(job, params).await
    }

    /// Drives every cron job until `shutdown` fires.
    ///
    /// Returns immediately when scheduling is disabled. After shutdown,
    /// returns once runs already in flight have finished.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) {
        if !self.enabled {
            info!("Scheduler disabled; no timers registered");
            return;
        }
        if self.jobs.is_empty() {
            info!("No jobs carry a cron expression; scheduler idle");
            return;
        }

        for job in &self.jobs {
            info!(job = %job.name, cron = %job.expr, "Registered scheduled job");
        }

        let loops = self
            .jobs
            .iter()
            .map(|job| self.job_loop(job, shutdown.resubscribe()));
        futures::future::join_all(loops).await;

        info!("Scheduler stopped");
    }

    async fn job_loop(&self, job: &ScheduledJob, mut shutdown: broadcast::Receiver<()>) {
        let mut last: Option<DateTime<Utc>> = None;
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&job.schedule, now, last) else {
                warn!(job = %job.name, cron = %job.expr, "Schedule has no future firings");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %job.name, next = %next, "Waiting for next firing");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last = Some(next);

            let Some(guard) = self.claim(&job.name) else {
                warn!(job = %job.name, "Previous run still active; skipping this firing");
                continue;
            };

            let pipeline = Arc::clone(&self.pipeline);
            let name = job.name.clone();
            in_flight = Some(tokio::spawn(async move {
                let _guard = guard;
                if let Ok(stats) = pipeline.run_import(&name, &ImportParams::default()).await {
                    debug!(job = %name, written = stats.written(), "Scheduled run finished");
                }
            }));
        }

        if let Some(handle) = in_flight.filter(|handle| !handle.is_finished()) {
            info!(job = %job.name, "Waiting for in-flight run to finish");
            if let Err(e) = handle.await {
                warn!(job = %job.name, error = %e, "Scheduled run task aborted");
            }
        }
    }

    fn claim(&self, job: &str) -> Option<RunGuard> {
        let flag = self.running.get(job)?;
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                flag: Arc::clone(flag),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, JobKind};
    use crate::testing::{MemoryStore, ScriptedFetcher};
    use chrono::TimeZone;
    use serde_json::json;

    type TestScheduler = Scheduler<ScriptedFetcher, MemoryStore, MemoryStore>;

    fn job(cron: Option<&str>) -> JobConfig {
        let mut job = JobConfig::new("openfda_ndc", JobKind::OpenfdaNdc);
        job.cron = cron.map(str::to_string);
        job
    }

    fn scheduler(fetcher: ScriptedFetcher, jobs: Vec<JobConfig>, enabled: bool) -> TestScheduler {
        let store = MemoryStore::new();
        let pipeline = ImportPipeline::new(fetcher, store.clone(), store, jobs);
        Scheduler::new(Arc::new(pipeline), enabled).unwrap()
    }

    fn empty_pages(n: usize) -> Vec<Result<serde_json::Value, crate::error::UpstreamError>> {
        (0..n).map(|_| Ok(json!({"results": []}))).collect()
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_cron(" 30 2 * * * "), "0 30 2 * * *");
        assert_eq!(normalize_cron("15 0 2 * * *"), "15 0 2 * * *");
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(matches!(
            parse_cron("every night"),
            Err(AppError::InvalidCron { expr, .. }) if expr == "every night"
        ));
    }

    #[test]
    fn test_next_fire_daily() {
        let schedule = parse_cron("0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
        assert_eq!(
            next_fire(&schedule, now, None),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap())
        );

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        assert_eq!(
            next_fire(&schedule, after, None),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_fire_never_repeats_a_tick() {
        let schedule = parse_cron("30 2 * * *").unwrap();
        let fired = Utc.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap();
        let early_wake = fired - chrono::Duration::milliseconds(3);
        assert_eq!(
            next_fire(&schedule, early_wake, Some(fired)),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_cron_fails_construction() {
        let store = MemoryStore::new();
        let pipeline = ImportPipeline::new(
            ScriptedFetcher::default(),
            store.clone(),
            store,
            vec![job(Some("not a cron"))],
        );
        assert!(matches!(
            Scheduler::new(Arc::new(pipeline), true),
            Err(AppError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_upcoming_lists_only_cron_jobs() {
        let mut manual = JobConfig::new("conditions", JobKind::ClinicaltablesConditions);
        manual.terms = Some("asthma".to_string());
        let scheduler = scheduler(
            ScriptedFetcher::default(),
            vec![job(Some("0 2 * * *")), manual],
            true,
        );
        let upcoming = scheduler.upcoming(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].0, "openfda_ndc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_rejects_concurrent_run() {
        let fetcher = ScriptedFetcher::new(empty_pages(2)).with_delay(Duration::from_secs(10));
        let scheduler = Arc::new(scheduler(fetcher, vec![job(None)], false));

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .trigger("openfda_ndc", &ImportParams::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(scheduler.is_running("openfda_ndc"));
        let busy = scheduler
            .trigger("openfda_ndc", &ImportParams::default())
            .await;
        assert!(matches!(busy, Err(AppError::JobBusy(job)) if job == "openfda_ndc"));

        assert!(first.await.unwrap().is_ok());
        assert!(!scheduler.is_running("openfda_ndc"));

        // guard released: the next trigger goes through
        assert!(scheduler
            .trigger("openfda_ndc", &ImportParams::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_trigger_unknown_job() {
        let scheduler = scheduler(ScriptedFetcher::default(), vec![job(None)], true);
        let err = scheduler
            .trigger("nope", &ImportParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns_immediately() {
        let scheduler = scheduler(ScriptedFetcher::default(), vec![job(Some("* * * * * *"))], false);
        let (_tx, rx) = broadcast::channel(1);
        scheduler.run(rx).await;
        assert!(!scheduler.is_running("openfda_ndc"));
        assert!(scheduler.pipeline().fetcher().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_firings_are_skipped() {
        // every second, while one run takes a minute
        let fetcher = ScriptedFetcher::new(empty_pages(5)).with_delay(Duration::from_secs(60));
        let scheduler = Arc::new(scheduler(fetcher, vec![job(Some("* * * * * *"))], true));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(scheduler.is_running("openfda_ndc"));
        tx.send(()).unwrap();
        handle.await.unwrap();

        // shutdown waited for the in-flight run
        assert!(!scheduler.is_running("openfda_ndc"));

        assert_eq!(scheduler.pipeline().fetcher().calls().len(), 1);
    }
}
