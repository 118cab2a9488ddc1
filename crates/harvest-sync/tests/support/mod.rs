#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use harvest_collectors::{CollectError, Collector, CollectorContext, CollectorRegistry, CollectorSettings};
use harvest_core::{
    CollectionResult, ConfigMap, Job, JobStatus, Schedule, Watermark, WatermarkKey,
};
use harvest_storage::{
    HttpMethod, JobFilter, JobStore, MemoryStore, RecordStore, ScheduleStore, StoreError, UpsertCounts,
    UpsertTarget, WatermarkStore, WatermarkUpdate,
};
use harvest_sync::{DomainEntry, DomainTable, HarvestConfig, Orchestrator};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Upsert this many rows into `<source>_rows`.
    Succeed(u64),
    /// Upsert one row and report one item failure.
    Partial,
    Fail,
    /// Open the HTTP client with one request, then panic.
    Panic,
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub source: String,
    pub config: ConfigMap,
    pub at: Instant,
    pub has_limiter: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn sources(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.source).collect()
    }
}

struct ScriptedCollector {
    source: String,
    settings: CollectorSettings,
    behavior: Behavior,
    log: CallLog,
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn source_id(&self) -> &str {
        &self.source
    }

    fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    fn default_endpoint(&self) -> &str {
        "http://127.0.0.1:9"
    }

    async fn collect(&self, ctx: &CollectorContext, config: &ConfigMap) -> Result<CollectionResult, CollectError> {
        self.log.0.lock().unwrap().push(Call {
            source: self.source.clone(),
            config: config.clone(),
            at: Instant::now(),
            has_limiter: self.settings.limiter.is_some(),
        });
        let mut result = CollectionResult::begin(ctx.domain(), ctx.source(), Utc::now());
        match self.behavior {
            Behavior::Succeed(n) => {
                let records: Vec<ConfigMap> = (0..n)
                    .map(|i| json!({ "id": i, "value": format!("{}-{i}", self.source) }))
                    .map(|v| v.as_object().cloned().unwrap_or_default())
                    .collect();
                result.record_fetched(n);
                let counts = ctx
                    .bulk_upsert(&format!("{}_rows", self.source), &records, &["id"], None)
                    .await?;
                result.record_upsert(counts.inserted, counts.updated);
                Ok(result.finish(Utc::now()))
            }
            Behavior::Partial => {
                let record = json!({ "id": 0, "value": format!("{}-0", self.source) });
                let records = vec![record.as_object().cloned().unwrap_or_default()];
                result.record_fetched(2);
                let counts = ctx
                    .bulk_upsert(&format!("{}_rows", self.source), &records, &["id"], None)
                    .await?;
                result.record_upsert(counts.inserted, counts.updated);
                result.record_failure(Some("1".into()), "malformed record");
                Ok(result.finish(Utc::now()))
            }
            Behavior::Fail => Err(CollectError::Other(format!("{} upstream exploded", self.source))),
            Behavior::Panic => {
                ctx.fetch_json("/ok", &ConfigMap::new(), HttpMethod::Get).await?;
                assert!(ctx.client_open());
                panic!("collector bug");
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(result.finish(Utc::now()))
            }
        }
    }
}

pub fn registry(entries: &[(&str, Behavior)], log: &CallLog) -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();
    for (source, behavior) in entries {
        let source = source.to_string();
        let behavior = *behavior;
        let log = log.clone();
        registry.register(source.clone(), move |settings| {
            Box::new(ScriptedCollector {
                source: source.clone(),
                settings,
                behavior,
                log: log.clone(),
            }) as Box<dyn Collector>
        });
    }
    registry
}

pub fn domains(entries: &[(&str, &[&str])]) -> DomainTable {
    DomainTable {
        domains: entries
            .iter()
            .map(|(name, sources)| DomainEntry {
                name: name.to_string(),
                sources: sources.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
    }
}

pub fn quiet_config() -> HarvestConfig {
    HarvestConfig {
        domain_delay: Duration::ZERO,
        rate_limit_delay: Duration::ZERO,
        ..HarvestConfig::default()
    }
}

pub fn orchestrator(registry: CollectorRegistry, domains: DomainTable, config: HarvestConfig) -> Orchestrator {
    Orchestrator::new(Arc::new(MemoryStore::new()), registry, domains, config)
}

/// [`MemoryStore`] with switchable faults.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    /// Reject every job insert.
    pub fail_job_inserts: AtomicBool,
    pub job_insert_attempts: AtomicUsize,
    /// Mark running jobs `success` right after they are listed, as if their
    /// runs finished concurrently.
    pub finish_after_listing: AtomicBool,
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.job_insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_job_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Decode {
                kind: "job",
                message: "connection reset".into(),
            });
        }
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.update_job(job).await
    }

    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        self.inner.update_job_if(job, expected).await
    }

    async fn get_job(&self, id: uuid::Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.inner.list_jobs(filter).await?;
        if self.finish_after_listing.load(Ordering::SeqCst) {
            for job in jobs.iter().filter(|j| j.status == JobStatus::Running) {
                let mut done = job.clone();
                done.status = JobStatus::Success;
                done.completed_at = Some(Utc::now());
                self.inner.update_job(&done).await?;
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl ScheduleStore for FaultyStore {
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.inner.insert_schedule(schedule).await
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.inner.update_schedule(schedule).await
    }

    async fn get_schedule(&self, id: uuid::Uuid) -> Result<Option<Schedule>, StoreError> {
        self.inner.get_schedule(id).await
    }

    async fn list_schedules(&self, active_only: bool) -> Result<Vec<Schedule>, StoreError> {
        self.inner.list_schedules(active_only).await
    }

    async fn delete_schedule(&self, id: uuid::Uuid) -> Result<bool, StoreError> {
        self.inner.delete_schedule(id).await
    }
}

#[async_trait]
impl WatermarkStore for FaultyStore {
    async fn get_watermark(&self, key: &WatermarkKey) -> Result<Option<Watermark>, StoreError> {
        self.inner.get_watermark(key).await
    }

    async fn upsert_watermark(&self, update: &WatermarkUpdate) -> Result<Watermark, StoreError> {
        self.inner.upsert_watermark(update).await
    }

    async fn clear_watermark(&self, key: &WatermarkKey) -> Result<bool, StoreError> {
        self.inner.clear_watermark(key).await
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        self.inner.list_watermarks().await
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn upsert_records(
        &self,
        target: UpsertTarget<'_>,
        records: &[ConfigMap],
    ) -> Result<UpsertCounts, StoreError> {
        self.inner.upsert_records(target, records).await
    }
}

pub fn faulty_orchestrator(
    store: Arc<FaultyStore>,
    registry: CollectorRegistry,
    domains: DomainTable,
    config: HarvestConfig,
) -> Orchestrator {
    Orchestrator::new(store, registry, domains, config)
}

pub async fn spawn_ok_server() -> String {
    let app = Router::new().route("/ok", get(|| async { Json(json!({ "ok": true })) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn wait_until_running(orchestrator: &Orchestrator, job_id: uuid::Uuid) {
    for _ in 0..200 {
        if orchestrator.is_running(job_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never started");
}
