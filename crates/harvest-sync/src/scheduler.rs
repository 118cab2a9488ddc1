//! Recurring triggers, incremental configuration, and the retry and
//! stuck-job sweeps.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use harvest_core::{
    Frequency, Job, JobError, JobFailure, JobStatus, NewSchedule, Schedule, WatermarkKey,
};
use harvest_storage::{JobFilter, StoreError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as TriggerJob, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::incremental::{inject_incremental, wants_incremental};
use crate::{HarvestConfig, JobHandle, Orchestrator, OrchestratorError};

/// Hour used by daily/weekly/monthly/quarterly schedules that name none.
pub const DEFAULT_HOUR: u32 = 6;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule {0} not found")]
    NotFound(Uuid),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("trigger engine: {0}")]
    Engine(#[from] JobSchedulerError),
}

/// Parse a cron expression, prepending a seconds field to 5-field input.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        cron::Schedule::from_str(&format!("0 {expr}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, 0, 0).map(|naive| Utc.from_utc_datetime(&naive))
}

fn add_months(year: i32, month: u32, months: u32) -> (i32, u32) {
    let index = year * 12 + (month as i32 - 1) + months as i32;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = add_months(year, month, 1);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

/// `day` of the given month at `hour`; days past the month's end clamp to
/// its last day.
fn month_slot(year: i32, month: u32, day: u32, hour: u32) -> Option<DateTime<Utc>> {
    let day = day.clamp(1, days_in_month(year, month)?);
    at_hour(NaiveDate::from_ymd_opt(year, month, day)?, hour)
}

/// Next firing strictly after `now`. Frequencies that cannot be evaluated
/// fall back to one hour from now.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = now + Duration::hours(1);
    let hour = schedule.hour.unwrap_or(DEFAULT_HOUR).min(23);
    let today = now.date_naive();

    let next = match &schedule.frequency {
        Frequency::Hourly => Some(fallback),
        Frequency::Daily => at_hour(today, hour)
            .filter(|slot| *slot > now)
            .or_else(|| at_hour(today + Duration::days(1), hour)),
        Frequency::Weekly => {
            let target = schedule.day_of_week.unwrap_or(0) % 7;
            let current = now.weekday().num_days_from_monday();
            let ahead = (target + 7 - current) % 7;
            at_hour(today + Duration::days(i64::from(ahead)), hour)
                .map(|slot| if slot > now { slot } else { slot + Duration::days(7) })
        }
        Frequency::Monthly => {
            let day = schedule.day_of_month.unwrap_or(1);
            (0..=1)
                .filter_map(|offset| {
                    let (year, month) = add_months(now.year(), now.month(), offset);
                    month_slot(year, month, day, hour)
                })
                .find(|slot| *slot > now)
        }
        Frequency::Quarterly => {
            let day = schedule.day_of_month.unwrap_or(1);
            let quarter_start = (now.month() - 1) / 3 * 3 + 1;
            (0..=2)
                .filter_map(|quarter| {
                    let (year, month) = add_months(now.year(), quarter_start, quarter * 3);
                    month_slot(year, month, day, hour)
                })
                .find(|slot| *slot > now)
        }
        Frequency::Custom => match schedule.cron_expression.as_deref().map(parse_cron) {
            Some(Ok(cron)) => cron.after(&now).next(),
            Some(Err(err)) => {
                warn!(schedule_id = %schedule.id, error = %err, "invalid cron expression, retrying in an hour");
                None
            }
            None => {
                warn!(schedule_id = %schedule.id, "custom schedule without cron expression");
                None
            }
        },
        Frequency::Unknown(other) => {
            warn!(schedule_id = %schedule.id, frequency = %other, "unknown frequency, retrying in an hour");
            None
        }
    };
    next.filter(|slot| *slot > now).unwrap_or(fallback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_attempts: u32,
    pub retry_base_delay: StdDuration,
    pub retry_max_delay: StdDuration,
    pub stuck_timeout: StdDuration,
    pub retry_sweep_interval: StdDuration,
    pub cleanup_sweep_interval: StdDuration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&HarvestConfig::default())
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_attempts: config.max_job_attempts,
            retry_base_delay: StdDuration::from_secs(5 * 60),
            retry_max_delay: StdDuration::from_secs(60 * 60),
            stuck_timeout: config.stuck_timeout,
            retry_sweep_interval: config.retry_sweep_interval,
            cleanup_sweep_interval: config.cleanup_sweep_interval,
        }
    }

    /// Wait before re-running a job that failed on `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> StdDuration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

fn chrono_duration(value: StdDuration) -> Duration {
    Duration::from_std(value).unwrap_or_else(|_| Duration::weeks(52 * 100))
}

type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TriggerEngine {
    jobs: JobScheduler,
    /// schedule id → one-shot trigger id
    triggers: HashMap<Uuid, Uuid>,
}

#[derive(Clone)]
pub struct Scheduler {
    orchestrator: Orchestrator,
    options: SchedulerOptions,
    engine: Arc<Mutex<Option<TriggerEngine>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("orchestrator", &self.orchestrator)
            .field("options", &self.options)
            .finish()
    }
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, options: SchedulerOptions) -> Self {
        Self {
            orchestrator,
            options,
            engine: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    fn validate(&self, new: &NewSchedule) -> Result<(), SchedulerError> {
        let invalid = |msg: String| Err(SchedulerError::InvalidSchedule(msg));
        if new.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if !self.orchestrator.has_collector(&new.source) {
            return invalid(format!("no collector registered for source {:?}", new.source));
        }
        if new.hour.is_some_and(|h| h > 23) {
            return invalid("hour must be within 0..=23".into());
        }
        if new.day_of_week.is_some_and(|d| d > 6) {
            return invalid("day_of_week must be within 0..=6 (0 = Monday)".into());
        }
        if new.day_of_month.is_some_and(|d| !(1..=31).contains(&d)) {
            return invalid("day_of_month must be within 1..=31".into());
        }
        if let Frequency::Unknown(other) = &new.frequency {
            return invalid(format!("unknown frequency {other:?}"));
        }
        if new.frequency == Frequency::Custom && new.cron_expression.is_none() {
            return invalid("custom frequency needs a cron_expression".into());
        }
        Ok(())
    }

    pub async fn register_schedule(&self, new: NewSchedule) -> Result<Schedule, SchedulerError> {
        self.validate(&new)?;
        let now = Utc::now();
        let mut schedule = Schedule::from_new(new, now);
        if schedule.is_active {
            schedule.next_run_at = Some(compute_next_run(&schedule, now));
        }
        self.orchestrator.store().insert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            source = %schedule.source,
            frequency = %schedule.frequency,
            next_run_at = ?schedule.next_run_at,
            "schedule registered"
        );
        self.arm(&schedule).await?;
        Ok(schedule)
    }

    async fn load(&self, id: Uuid) -> Result<Schedule, SchedulerError> {
        self.orchestrator
            .store()
            .get_schedule(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Activation recomputes the next run from now and arms a trigger;
    /// deactivation disarms it.
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.load(id).await?;
        let now = Utc::now();
        schedule.is_active = active;
        schedule.next_run_at = active.then(|| compute_next_run(&schedule, now));
        schedule.updated_at = now;
        self.orchestrator.store().update_schedule(&schedule).await?;
        info!(schedule_id = %id, active, "schedule toggled");
        self.arm(&schedule).await?;
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool, SchedulerError> {
        self.disarm(id).await?;
        Ok(self.orchestrator.store().delete_schedule(id).await?)
    }

    pub async fn list_schedules(&self, active_only: bool) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.orchestrator.store().list_schedules(active_only).await?)
    }

    /// Per-run configuration: the schedule's config, with the incremental
    /// bound injected when requested. A source that has never been collected
    /// for its domain gets a full load.
    pub async fn build_run_config(&self, schedule: &Schedule) -> Result<harvest_core::ConfigMap, SchedulerError> {
        if !wants_incremental(&schedule.config) {
            return Ok(schedule.config.clone());
        }
        let mut since = schedule.last_run_at;
        if let Some(domain) = self.orchestrator.domains().domain_of(&schedule.source) {
            let region = schedule.config.get("region").and_then(JsonValue::as_str);
            let key = WatermarkKey::new(domain, schedule.source.as_str(), region);
            if self.orchestrator.store().get_watermark(&key).await?.is_none() {
                since = None;
            }
        }
        Ok(inject_incremental(&schedule.source, &schedule.config, since))
    }

    /// Fire one schedule: dispatch its job, stamp `last_run_at`, and move
    /// `next_run_at` forward whatever the job's eventual outcome. Missing or
    /// inactive schedules are a no-op. A dispatch error still moves
    /// `next_run_at` forward and re-arms the trigger before it is returned.
    pub async fn run_scheduled_job(&self, schedule_id: Uuid) -> Result<Option<JobHandle>, SchedulerError> {
        let Some(mut schedule) = self.orchestrator.store().get_schedule(schedule_id).await? else {
            debug!(schedule_id = %schedule_id, "schedule missing, skipping");
            return Ok(None);
        };
        if !schedule.is_active {
            debug!(schedule_id = %schedule_id, "schedule inactive, skipping");
            return Ok(None);
        }

        let handle = match self.dispatch_schedule(&schedule).await {
            Ok(handle) => handle,
            Err(err) => {
                let now = Utc::now();
                schedule.next_run_at = Some(compute_next_run(&schedule, now));
                schedule.updated_at = now;
                warn!(
                    schedule_id = %schedule_id,
                    error = %err,
                    next_run_at = ?schedule.next_run_at,
                    "scheduled dispatch failed, rescheduling"
                );
                if let Err(store_err) = self.orchestrator.store().update_schedule(&schedule).await {
                    error!(schedule_id = %schedule_id, error = %store_err, "could not persist next run");
                }
                self.arm(&schedule).await?;
                return Err(err);
            }
        };

        let now = Utc::now();
        schedule.last_run_at = Some(now);
        schedule.last_job_id = Some(handle.job_id);
        schedule.next_run_at = Some(compute_next_run(&schedule, now));
        schedule.updated_at = now;
        self.orchestrator.store().update_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule_id,
            job_id = %handle.job_id,
            next_run_at = ?schedule.next_run_at,
            "scheduled job dispatched"
        );
        self.arm(&schedule).await?;
        Ok(Some(handle))
    }

    async fn dispatch_schedule(&self, schedule: &Schedule) -> Result<JobHandle, SchedulerError> {
        let config = self.build_run_config(schedule).await?;
        let domain = self.orchestrator.domains().domain_of(&schedule.source);
        Ok(self.orchestrator.submit(domain, &schedule.source, config).await?)
    }

    /// Re-dispatch failed, retryable jobs whose backoff has elapsed. Each
    /// failed job is retried at most once; the retry carries the lineage.
    pub async fn process_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobHandle>, SchedulerError> {
        let store = self.orchestrator.store();
        let candidates = store
            .list_jobs(&JobFilter::retry_candidates(self.options.max_attempts))
            .await?;
        let mut handles = Vec::new();
        for mut job in candidates {
            let failed_at = job.completed_at.unwrap_or(job.created_at);
            if failed_at + chrono_duration(self.options.retry_delay(job.attempt)) > now {
                continue;
            }

            let retry = Job::retry_of(&job, now);
            job.retried_by = Some(retry.id);
            store.update_job(&job).await?;
            info!(
                job_id = %job.id,
                retry_id = %retry.id,
                attempt = retry.attempt,
                error_type = ?job.error_type(),
                "retrying failed job"
            );
            handles.push(self.orchestrator.submit_job(retry).await?);
        }
        Ok(handles)
    }

    /// Fail jobs left `running` past the stuck timeout and abort their task
    /// if it lives in this process.
    pub async fn cleanup_stuck_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, SchedulerError> {
        let store = self.orchestrator.store();
        let timeout = chrono_duration(self.options.stuck_timeout);
        let running = store.list_jobs(&JobFilter::with_status(JobStatus::Running)).await?;
        let mut cleaned = Vec::new();
        for mut job in running {
            let started_at = job.started_at.unwrap_or(job.created_at);
            if started_at + timeout >= now {
                continue;
            }
            let message = format!(
                "job running since {} exceeded the {}s timeout",
                started_at.to_rfc3339(),
                self.options.stuck_timeout.as_secs()
            );
            job.fail(JobFailure::retryable("stuck_timeout", message), now)?;
            if !store.update_job_if(&job, JobStatus::Running).await? {
                debug!(job_id = %job.id, "job finished before the sweep reached it");
                continue;
            }
            let aborted = self.orchestrator.cancel(job.id);
            warn!(job_id = %job.id, source = %job.source, aborted, "stuck job failed");
            cleaned.push(job.id);
        }
        Ok(cleaned)
    }

    async fn arm(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        let mut guard = self.engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            return Ok(());
        };
        if let Some(previous) = engine.triggers.remove(&schedule.id) {
            engine.jobs.remove(&previous).await?;
        }
        let (true, Some(next_run_at)) = (schedule.is_active, schedule.next_run_at) else {
            return Ok(());
        };

        let wait = (next_run_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let scheduler = self.clone();
        let schedule_id = schedule.id;
        let trigger = TriggerJob::new_one_shot_async(wait, move |_uuid, _lock| scheduler.fire(schedule_id))?;
        let trigger_id = engine.jobs.add(trigger).await?;
        engine.triggers.insert(schedule.id, trigger_id);
        debug!(schedule_id = %schedule.id, wait_secs = wait.as_secs(), "trigger armed");
        Ok(())
    }

    async fn disarm(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        let mut guard = self.engine.lock().await;
        if let Some(engine) = guard.as_mut() {
            if let Some(trigger) = engine.triggers.remove(&schedule_id) {
                engine.jobs.remove(&trigger).await?;
            }
        }
        Ok(())
    }

    fn fire(&self, schedule_id: Uuid) -> TriggerFuture {
        let scheduler = self.clone();
        Box::pin(async move {
            if let Some(engine) = scheduler.engine.lock().await.as_mut() {
                engine.triggers.remove(&schedule_id);
            }
            match scheduler.run_scheduled_job(schedule_id).await {
                Ok(Some(handle)) => debug!(schedule_id = %schedule_id, job_id = %handle.job_id, "trigger fired"),
                Ok(None) => debug!(schedule_id = %schedule_id, "trigger fired for inactive schedule"),
                Err(err) => error!(schedule_id = %schedule_id, error = %err, "scheduled run failed to dispatch"),
            }
        })
    }

    /// Start the trigger engine: one trigger per active schedule plus the
    /// retry and stuck-job sweeps.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let jobs = JobScheduler::new().await?;
        {
            let mut guard = self.engine.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(TriggerEngine {
                jobs: jobs.clone(),
                triggers: HashMap::new(),
            });
        }

        let retry_scheduler = self.clone();
        jobs.add(TriggerJob::new_repeated_async(
            self.options.retry_sweep_interval,
            move |_uuid, _lock| {
                let scheduler = retry_scheduler.clone();
                Box::pin(async move {
                    match scheduler.process_retries(Utc::now()).await {
                        Ok(handles) if !handles.is_empty() => info!(count = handles.len(), "retry sweep dispatched jobs"),
                        Ok(_) => debug!("retry sweep found nothing"),
                        Err(err) => error!(error = %err, "retry sweep failed"),
                    }
                })
            },
        )?)
        .await?;

        let cleanup_scheduler = self.clone();
        jobs.add(TriggerJob::new_repeated_async(
            self.options.cleanup_sweep_interval,
            move |_uuid, _lock| {
                let scheduler = cleanup_scheduler.clone();
                Box::pin(async move {
                    match scheduler.cleanup_stuck_jobs(Utc::now()).await {
                        Ok(ids) if !ids.is_empty() => warn!(count = ids.len(), "cleanup sweep failed stuck jobs"),
                        Ok(_) => debug!("cleanup sweep found nothing"),
                        Err(err) => error!(error = %err, "cleanup sweep failed"),
                    }
                })
            },
        )?)
        .await?;

        let now = Utc::now();
        let active = self.orchestrator.store().list_schedules(true).await?;
        for mut schedule in active {
            if schedule.next_run_at.is_none() {
                schedule.next_run_at = Some(compute_next_run(&schedule, now));
                schedule.updated_at = now;
                self.orchestrator.store().update_schedule(&schedule).await?;
            }
            self.arm(&schedule).await?;
        }

        jobs.start().await?;
        info!(
            retry_sweep_secs = self.options.retry_sweep_interval.as_secs(),
            cleanup_sweep_secs = self.options.cleanup_sweep_interval.as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let engine = self.engine.lock().await.take();
        if let Some(mut engine) = engine {
            engine.jobs.shutdown().await?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}
