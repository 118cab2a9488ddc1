//! Persistence + outbound HTTP utilities for Harvest.
//!
//! The store traits cover the three bookkeeping records (jobs, schedules,
//! watermarks) plus the generic record upsert every collector writes through.
//! [`MemoryStore`] backs tests and dry runs; [`PgStore`] is the durable store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{ConfigMap, Job, JobError, JobStatus, Schedule, Watermark, WatermarkKey};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "harvest-storage";

// ---------------------------------------------------------------------------
// Outbound HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate limiting is worth waiting out; every other error status is
/// treated as a client problem that a retry will not fix.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request budget shared by every collector that talks to one provider.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Lazily created token buckets keyed by provider name.
#[derive(Debug, Default)]
pub struct ProviderLimiters {
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
}

impl ProviderLimiters {
    pub async fn bucket_for(&self, provider: &str, config: TokenBucketConfig) -> Arc<SimpleTokenBucket> {
        let mut map = self.buckets.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(SimpleTokenBucket::new(config)))
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub backoff: BackoffPolicy,
    pub limiter: Option<Arc<SimpleTokenBucket>>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_headers: Vec::new(),
            backoff: BackoffPolicy::default(),
            limiter: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("retries exhausted for {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: usize },
    #[error("decoding json from {url}: {message}")]
    Decode { url: String, message: String },
}

/// A collector's exclusive outbound client.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<String>,
    backoff: BackoffPolicy,
    limiter: Option<Arc<SimpleTokenBucket>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().map_err(FetchError::Build)?,
            base_url: config.base_url.map(|u| u.trim_end_matches('/').to_string()),
            backoff: config.backoff,
            limiter: config.limiter,
        })
    }

    pub fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        match &self.base_url {
            Some(base) if endpoint.is_empty() => base.clone(),
            Some(base) => format!("{}/{}", base, endpoint.trim_start_matches('/')),
            None => endpoint.to_string(),
        }
    }

    /// Issue one JSON request, waiting out 429s and transient network errors
    /// with a doubling delay. Any other error status is returned immediately.
    pub async fn fetch_json(
        &self,
        endpoint: &str,
        params: &ConfigMap,
        method: HttpMethod,
    ) -> Result<JsonValue, FetchError> {
        let url = self.resolve_url(endpoint);
        let span = info_span!("http_fetch", url = %url, method = ?method);
        self.fetch_json_inner(&url, params, method).instrument(span).await
    }

    async fn fetch_json_inner(
        &self,
        url: &str,
        params: &ConfigMap,
        method: HttpMethod,
    ) -> Result<JsonValue, FetchError> {
        let attempts = self.backoff.max_attempts();
        let query = query_pairs(params);

        for attempt in 0..attempts {
            if let Some(bucket) = &self.limiter {
                bucket.take().await;
            }

            let request = match method {
                HttpMethod::Get => self.client.get(url).query(&query),
                HttpMethod::Post => self.client.post(url).json(params),
            };

            let retry_reason = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(|e| FetchError::Decode {
                            url: url.to_string(),
                            message: e.to_string(),
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    format!("http status {}", status.as_u16())
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                    err.to_string()
                }
            };

            if attempt + 1 < attempts {
                let wait = self.backoff.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, wait_ms = wait.as_millis() as u64, reason = %retry_reason, "retrying request");
                tokio::time::sleep(wait).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

/// Flatten a JSON param map into query pairs; nulls are dropped and arrays
/// are joined with commas.
pub fn query_pairs(params: &ConfigMap) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)))
        .collect()
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => Some(
            items
                .iter()
                .filter_map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid sql identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("record is missing unique key field {0:?}")]
    MissingKey(String),
    #[error("decoding stored {kind}: {message}")]
    Decode { kind: &'static str, message: String },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Incoming values replace stored ones, nulls included.
    Overwrite,
    /// An incoming null never replaces a stored non-null value.
    PreserveNonNull,
}

/// Where and how a batch of records is merged.
#[derive(Debug, Clone, Copy)]
pub struct UpsertTarget<'a> {
    pub table: &'a str,
    pub unique_keys: &'a [&'a str],
    /// `None` means every non-key field of the incoming records.
    pub update_keys: Option<&'a [&'a str]>,
    pub mode: UpsertMode,
}

impl UpsertTarget<'_> {
    /// Columns written on conflict for this batch.
    pub fn update_columns(&self, records: &[ConfigMap]) -> Vec<String> {
        match self.update_keys {
            Some(keys) => keys
                .iter()
                .filter(|k| !self.unique_keys.contains(k))
                .map(|k| k.to_string())
                .collect(),
            None => record_columns(records)
                .into_iter()
                .filter(|c| !self.unique_keys.contains(&c.as_str()))
                .collect(),
        }
    }
}

/// Sorted union of field names across a batch.
pub fn record_columns(records: &[ConfigMap]) -> Vec<String> {
    let columns: Vec<String> = records
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    columns
}

fn unique_key_of(record: &ConfigMap, unique_keys: &[&str]) -> Result<String, StoreError> {
    let mut parts = Vec::with_capacity(unique_keys.len());
    for key in unique_keys {
        match record.get(*key) {
            Some(value) if !value.is_null() => parts.push(value.clone()),
            _ => return Err(StoreError::MissingKey(key.to_string())),
        }
    }
    Ok(JsonValue::Array(parts).to_string())
}

/// Collapse records sharing a unique key within one batch; the last one wins.
/// A single statement may not touch the same row twice.
pub fn dedupe_records(records: &[ConfigMap], unique_keys: &[&str]) -> Result<Vec<ConfigMap>, StoreError> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, ConfigMap> = HashMap::new();
    for record in records {
        let key = unique_key_of(record, unique_keys)?;
        if latest.insert(key.clone(), record.clone()).is_none() {
            order.push(key);
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|k| latest.remove(&k))
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source: Option<String>,
    pub retryable: Option<bool>,
    /// Only jobs no retry has been created for yet.
    pub unretried: bool,
    /// Only jobs whose attempt number is strictly below this.
    pub attempt_below: Option<u32>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Failed, retryable jobs without a retry that still have attempts left.
    pub fn retry_candidates(max_attempts: u32) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            retryable: Some(true),
            unretried: true,
            attempt_below: Some(max_attempts),
            ..Self::default()
        }
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.source.as_deref().map_or(true, |s| job.source == s)
            && self.retryable.map_or(true, |r| job.retryable == r)
            && (!self.unretried || job.retried_by.is_none())
            && self.attempt_below.map_or(true, |max| job.attempt < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub key: WatermarkKey,
    pub collected_at: DateTime<Utc>,
    pub job_id: Option<Uuid>,
    pub records_collected: Option<i64>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    /// Write `job` only if the stored row is still in `expected` status.
    /// Returns `false` when another writer moved it first.
    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    /// Oldest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError>;
    async fn list_schedules(&self, active_only: bool) -> Result<Vec<Schedule>, StoreError>;
    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(&self, key: &WatermarkKey) -> Result<Option<Watermark>, StoreError>;
    async fn upsert_watermark(&self, update: &WatermarkUpdate) -> Result<Watermark, StoreError>;
    async fn clear_watermark(&self, key: &WatermarkKey) -> Result<bool, StoreError>;
    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Merge one batch. Records sharing a unique key are collapsed first.
    async fn upsert_records(
        &self,
        target: UpsertTarget<'_>,
        records: &[ConfigMap],
    ) -> Result<UpsertCounts, StoreError>;
}

/// Everything the orchestration core persists through.
pub trait Store: JobStore + ScheduleStore + WatermarkStore + RecordStore {}

impl<T> Store for T where T: JobStore + ScheduleStore + WatermarkStore + RecordStore {}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    job_order: Vec<Uuid>,
    schedules: HashMap<Uuid, Schedule>,
    schedule_order: Vec<Uuid>,
    watermarks: BTreeMap<WatermarkKey, Watermark>,
    tables: HashMap<String, Vec<ConfigMap>>,
}

/// Process-local store with the same semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table_rows(&self, table: &str) -> Vec<ConfigMap> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.insert(job.id, job.clone()).is_none() {
            state.job_order.push(job.id);
        }
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "job",
                id: job.id.to_string(),
            }),
        }
    }

    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job.id) {
            Some(slot) if slot.status == expected => {
                *slot = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                kind: "job",
                id: job.id.to_string(),
            }),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let jobs = state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| filter.matches(job))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(jobs)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.schedules.insert(schedule.id, schedule.clone()).is_none() {
            state.schedule_order.push(schedule.id);
        }
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.schedules.get_mut(&schedule.id) {
            Some(slot) => {
                *slot = schedule.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "schedule",
                id: schedule.id.to_string(),
            }),
        }
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        Ok(self.state.lock().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self, active_only: bool) -> Result<Vec<Schedule>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .schedule_order
            .iter()
            .filter_map(|id| state.schedules.get(id))
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.schedule_order.retain(|s| *s != id);
        Ok(state.schedules.remove(&id).is_some())
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get_watermark(&self, key: &WatermarkKey) -> Result<Option<Watermark>, StoreError> {
        Ok(self.state.lock().await.watermarks.get(key).cloned())
    }

    async fn upsert_watermark(&self, update: &WatermarkUpdate) -> Result<Watermark, StoreError> {
        let mut state = self.state.lock().await;
        let watermark = state
            .watermarks
            .entry(update.key.clone())
            .and_modify(|wm| {
                wm.last_collected_at = update.collected_at;
                wm.last_job_id = update.job_id;
                wm.records_collected = update.records_collected;
                wm.updated_at = update.collected_at;
            })
            .or_insert_with(|| Watermark {
                domain: update.key.domain.clone(),
                source: update.key.source.clone(),
                region: update.key.region.clone(),
                last_collected_at: update.collected_at,
                last_job_id: update.job_id,
                records_collected: update.records_collected,
                created_at: update.collected_at,
                updated_at: update.collected_at,
            });
        Ok(watermark.clone())
    }

    async fn clear_watermark(&self, key: &WatermarkKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.watermarks.remove(key).is_some())
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        Ok(self.state.lock().await.watermarks.values().cloned().collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_records(
        &self,
        target: UpsertTarget<'_>,
        records: &[ConfigMap],
    ) -> Result<UpsertCounts, StoreError> {
        validate_identifier(target.table)?;
        let records = dedupe_records(records, target.unique_keys)?;
        let update_columns = target.update_columns(&records);

        let mut state = self.state.lock().await;
        let rows = state.tables.entry(target.table.to_string()).or_default();
        let mut counts = UpsertCounts::default();

        for record in records {
            let key = unique_key_of(&record, target.unique_keys)?;
            let existing = rows
                .iter()
                .position(|row| unique_key_of(row, target.unique_keys).ok().as_deref() == Some(key.as_str()));
            match existing {
                // nothing to write on conflict: the row is left alone and not counted
                Some(_) if update_columns.is_empty() => {}
                Some(index) => {
                    let row = &mut rows[index];
                    for column in &update_columns {
                        let incoming = record.get(column).cloned().unwrap_or(JsonValue::Null);
                        let keep_stored = target.mode == UpsertMode::PreserveNonNull
                            && incoming.is_null()
                            && row.get(column).is_some_and(|v| !v.is_null());
                        if !keep_stored {
                            row.insert(column.clone(), incoming);
                        }
                    }
                    counts.updated += 1;
                }
                None => {
                    rows.push(record);
                    counts.inserted += 1;
                }
            }
        }
        debug!(table = target.table, inserted = counts.inserted, updated = counts.updated, "memory upsert");
        Ok(counts)
    }
}

/// Accept `name` or `schema.name` made of ASCII letters, digits and underscores.
pub fn validate_identifier(ident: &str) -> Result<(), StoreError> {
    let valid = !ident.is_empty()
        && ident.split('.').count() <= 2
        && ident.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}
