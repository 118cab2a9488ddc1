//! Core domain model for Harvest: jobs, schedules, watermarks and collection results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Opaque key-value configuration handed to a collector run.
pub type ConfigMap = Map<String, JsonValue>;

/// Upper bound on diagnostic records carried by a [`CollectionResult`].
pub const MAX_SAMPLE_RECORDS: usize = 5;

/// Upper bound on per-item errors kept on a [`CollectionResult`]; the
/// `failed` counter keeps counting past it.
pub const MAX_ITEM_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Partial | JobStatus::Failed)
    }

    /// Status only moves forward: pending → running → {success|partial|failed}.
    /// A pending job may fail directly when it is rejected before starting.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Partial)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "partial" => Ok(JobStatus::Partial),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
}

/// Why a job ended up `failed`, folded into `error_message` / `error_details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl JobFailure {
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: true,
            errors: Vec::new(),
        }
    }

    /// Configuration problems: retrying would only burn attempts.
    pub fn permanent(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(error_type, message)
        }
    }

    pub fn details(&self) -> ConfigMap {
        let mut details = ConfigMap::new();
        details.insert("error_type".into(), json!(self.error_type));
        details.insert("message".into(), json!(self.message));
        details.insert("retryable".into(), json!(self.retryable));
        if !self.errors.is_empty() {
            details.insert("errors".into(), json!(self.errors));
        }
        details
    }
}

/// Persisted unit of collection work. Never deleted; retries create new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: String,
    pub domain: Option<String>,
    pub status: JobStatus,
    pub config: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub error_details: Option<ConfigMap>,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
    pub retried_by: Option<Uuid>,
    pub retryable: bool,
}

impl Job {
    pub fn new(source: impl Into<String>, config: ConfigMap, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            domain: None,
            status: JobStatus::Pending,
            config,
            created_at: now,
            started_at: None,
            completed_at: None,
            records_processed: 0,
            rows_inserted: 0,
            rows_updated: 0,
            records_failed: 0,
            error_message: None,
            error_details: None,
            attempt: 1,
            retry_of: None,
            retried_by: None,
            retryable: true,
        }
    }

    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Fresh pending job re-running `original` with the same source and config.
    pub fn retry_of(original: &Job, now: DateTime<Utc>) -> Self {
        let mut job = Job::new(original.source.clone(), original.config.clone(), now)
            .with_domain(original.domain.clone());
        job.attempt = original.attempt.saturating_add(1);
        job.retry_of = Some(original.id);
        job
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now.max(self.created_at));
        Ok(())
    }

    /// Fold a collection result into the job and move it to its terminal state.
    pub fn finish(&mut self, result: &CollectionResult, now: DateTime<Utc>) -> Result<(), JobError> {
        let status = match result.status {
            CollectionStatus::Success => JobStatus::Success,
            CollectionStatus::Partial => JobStatus::Partial,
            CollectionStatus::Failed => JobStatus::Failed,
        };
        self.transition(status)?;
        self.records_processed = result.processed;
        self.rows_inserted = result.inserted;
        self.rows_updated = result.updated;
        self.records_failed = result.failed;
        self.completed_at = Some(self.clamp_completion(now));

        if status != JobStatus::Success {
            let message = result
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("{} of {} records failed", result.failed, result.total));
            let error_type = if status == JobStatus::Partial {
                "partial_failure"
            } else {
                "collection_failed"
            };
            let failure = JobFailure {
                errors: result.errors.clone(),
                ..JobFailure::retryable(error_type, message)
            };
            self.error_message = Some(failure.message.clone());
            self.error_details = Some(failure.details());
            self.retryable = failure.retryable;
        }
        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(self.clamp_completion(now));
        self.error_message = Some(failure.message.clone());
        self.error_details = Some(failure.details());
        self.retryable = failure.retryable;
        Ok(())
    }

    fn clamp_completion(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.started_at.unwrap_or(self.created_at))
    }

    pub fn error_type(&self) -> Option<&str> {
        self.error_details
            .as_ref()
            .and_then(|d| d.get("error_type"))
            .and_then(JsonValue::as_str)
    }
}

/// Recurrence of a [`Schedule`]. Unrecognized values survive a round trip as
/// `Unknown` instead of failing the whole schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Custom,
    Unknown(String),
}

impl Frequency {
    pub fn as_str(&self) -> &str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Custom => "custom",
            Frequency::Unknown(other) => other,
        }
    }
}

impl From<String> for Frequency {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Frequency::Hourly,
            "daily" => Frequency::Daily,
            "weekly" => Frequency::Weekly,
            "monthly" => Frequency::Monthly,
            "quarterly" => Frequency::Quarterly,
            "custom" | "cron" => Frequency::Custom,
            _ => Frequency::Unknown(value),
        }
    }
}

impl From<&str> for Frequency {
    fn from(value: &str) -> Self {
        Frequency::from(value.to_string())
    }
}

impl From<Frequency> for String {
    fn from(value: Frequency) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration payload for a new schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub config: ConfigMap,
    pub frequency: Frequency,
    #[serde(default)]
    pub hour: Option<u32>,
    /// 0 = Monday.
    #[serde(default)]
    pub day_of_week: Option<u32>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub source: String,
    pub config: ConfigMap,
    pub frequency: Frequency,
    pub hour: Option<u32>,
    pub day_of_week: Option<u32>,
    pub day_of_month: Option<u32>,
    pub cron_expression: Option<String>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<Uuid>,
    pub priority: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn from_new(new: NewSchedule, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            source: new.source,
            config: new.config,
            frequency: new.frequency,
            hour: new.hour,
            day_of_week: new.day_of_week,
            day_of_month: new.day_of_month,
            cron_expression: new.cron_expression,
            is_active: new.is_active,
            last_run_at: None,
            next_run_at: None,
            last_job_id: None,
            priority: new.priority,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Identity of a watermark row: (domain, source, region-or-null).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub domain: String,
    pub source: String,
    pub region: Option<String>,
}

impl WatermarkKey {
    pub fn new(domain: impl Into<String>, source: impl Into<String>, region: Option<&str>) -> Self {
        Self {
            domain: domain.into(),
            source: source.into(),
            region: region.map(ToString::to_string),
        }
    }
}

impl fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}/{}/{}", self.domain, self.source, region),
            None => write!(f, "{}/{}", self.domain, self.source),
        }
    }
}

/// Last successful collection for a key. No row means "full sync next time".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub domain: String,
    pub source: String,
    #[serde(alias = "state")]
    pub region: Option<String>,
    pub last_collected_at: DateTime<Utc>,
    pub last_job_id: Option<Uuid>,
    pub records_collected: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn key(&self) -> WatermarkKey {
        WatermarkKey {
            domain: self.domain.clone(),
            source: self.source.clone(),
            region: self.region.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: Option<String>,
    pub message: String,
}

/// Outcome of one collector run; folded into its [`Job`], never stored alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub status: CollectionStatus,
    pub domain: String,
    pub source: String,
    pub total: u64,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub sample: Vec<JsonValue>,
}

impl CollectionResult {
    pub fn begin(domain: impl Into<String>, source: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            status: CollectionStatus::Success,
            domain: domain.into(),
            source: source.into(),
            total: 0,
            processed: 0,
            inserted: 0,
            updated: 0,
            failed: 0,
            started_at,
            completed_at: started_at,
            duration_ms: 0,
            errors: Vec::new(),
            sample: Vec::new(),
        }
    }

    /// A run that failed as a whole before producing anything.
    pub fn failed_run(
        domain: impl Into<String>,
        source: impl Into<String>,
        started_at: DateTime<Utc>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::begin(domain, source, started_at);
        result.errors.push(ItemError {
            item: None,
            message: message.into(),
        });
        result.status = CollectionStatus::Failed;
        result.stamp_completion(now);
        result
    }

    pub fn record_fetched(&mut self, count: u64) {
        self.total += count;
    }

    pub fn record_upsert(&mut self, inserted: u64, updated: u64) {
        self.inserted += inserted;
        self.updated += updated;
        self.processed += inserted + updated;
    }

    pub fn record_failure(&mut self, item: Option<String>, message: impl Into<String>) {
        self.failed += 1;
        if self.errors.len() < MAX_ITEM_ERRORS {
            self.errors.push(ItemError {
                item,
                message: message.into(),
            });
        }
    }

    pub fn push_sample(&mut self, record: JsonValue) {
        if self.sample.len() < MAX_SAMPLE_RECORDS {
            self.sample.push(record);
        }
    }

    /// Derive the final status from the counters and stamp completion.
    pub fn finish(mut self, now: DateTime<Utc>) -> Self {
        self.total = self.total.max(self.processed + self.failed);
        self.status = if self.failed == 0 && self.errors.is_empty() {
            CollectionStatus::Success
        } else if self.processed > 0 {
            CollectionStatus::Partial
        } else {
            CollectionStatus::Failed
        };
        self.stamp_completion(now);
        self
    }

    fn stamp_completion(&mut self, now: DateTime<Utc>) {
        self.completed_at = now.max(self.started_at);
        self.duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }

    pub fn is_success(&self) -> bool {
        self.status == CollectionStatus::Success
    }
}
