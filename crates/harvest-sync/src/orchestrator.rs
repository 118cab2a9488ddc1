use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use harvest_collectors::{ClientGauge, CollectorContext, CollectorRegistry, RegistryError};
use harvest_core::{
    CollectionResult, CollectionStatus, ConfigMap, Job, JobError, JobFailure, JobStatus, WatermarkKey,
};
use harvest_storage::{ProviderLimiters, SimpleTokenBucket, Store, StoreError, WatermarkUpdate};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{DomainTable, HarvestConfig};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unknown domain {0:?}")]
    UnknownDomain(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("dispatch task for job {job_id} ended abnormally: {message}")]
    Dispatch { job_id: Uuid, message: String },
}

/// Trackable dispatch of one job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub join: JoinHandle<Result<CollectionResult, OrchestratorError>>,
}

impl JobHandle {
    pub async fn wait(self) -> Result<CollectionResult, OrchestratorError> {
        let job_id = self.job_id;
        self.join.await.map_err(|e| OrchestratorError::Dispatch {
            job_id,
            message: e.to_string(),
        })?
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Completed { result: CollectionResult },
    Errored { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRun {
    pub source: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

impl SourceRun {
    pub fn result(&self) -> Option<&CollectionResult> {
        match &self.outcome {
            SourceOutcome::Completed { result } => Some(result),
            SourceOutcome::Errored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainRunReport {
    pub domain: String,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: chrono::DateTime<Utc>,
    /// Per-source runs in execution order.
    pub sources: Vec<SourceRun>,
    /// Set when the domain could not be run at all.
    pub error: Option<String>,
}

impl DomainRunReport {
    pub fn succeeded(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.result().is_some_and(CollectionResult::is_success))
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FullSyncReport {
    pub domains: Vec<DomainRunReport>,
}

/// Owns job lifecycle around collector runs.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: Arc<CollectorRegistry>,
    domains: Arc<DomainTable>,
    config: Arc<HarvestConfig>,
    gauge: ClientGauge,
    limiters: Arc<ProviderLimiters>,
    in_flight: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("domains", &self.domains)
            .field("open_clients", &self.gauge.open_clients())
            .finish()
    }
}

fn join_failure(err: &JoinError) -> JobFailure {
    if err.is_cancelled() {
        JobFailure::retryable("cancelled", "collector run was cancelled")
    } else {
        JobFailure::retryable("panic", format!("collector panicked: {err}"))
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: CollectorRegistry,
        domains: DomainTable,
        config: HarvestConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            domains: Arc::new(domains),
            config: Arc::new(config),
            gauge: ClientGauge::new(),
            limiters: Arc::new(ProviderLimiters::default()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn has_collector(&self, source: &str) -> bool {
        self.registry.contains(source)
    }

    /// Outbound clients currently held by running collectors.
    pub fn open_clients(&self) -> usize {
        self.gauge.open_clients()
    }

    /// The request budget every run of `source` draws from, if it has one.
    pub async fn limiter_for(&self, source: &str) -> Option<Arc<SimpleTokenBucket>> {
        let budget = self.config.request_budget(source)?;
        Some(self.limiters.bucket_for(source, budget).await)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.in_flight().contains_key(&job_id)
    }

    /// Abort the collector task of an in-flight job. The job is finalized as
    /// `failed` with error type `cancelled` unless already terminal.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.in_flight().remove(&job_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn create_job(
        &self,
        domain: Option<&str>,
        source: &str,
        config: ConfigMap,
    ) -> Result<Job, OrchestratorError> {
        let job = Job::new(source, config, Utc::now()).with_domain(domain.map(ToString::to_string));
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, source, domain = ?domain, "job created");
        Ok(job)
    }

    /// Run a persisted pending job to completion on the current task.
    ///
    /// Collector failures, panics and cancellation all come back as a failed
    /// [`CollectionResult`]; `Err` is reserved for an unregistered source and
    /// store failures.
    pub async fn execute_job(&self, mut job: Job) -> Result<CollectionResult, OrchestratorError> {
        let domain = job.domain.clone().unwrap_or_else(|| job.source.clone());
        let span = info_span!("job", job_id = %job.id, source = %job.source, domain = %domain);
        async move {
            let mut settings = self.config.collector_settings(&job.source);
            settings.limiter = self.limiter_for(&job.source).await;
            let collector = match self.registry.create(&job.source, settings) {
                Ok(collector) => collector,
                Err(err) => {
                    warn!(error = %err, "cannot resolve collector");
                    job.fail(JobFailure::permanent("configuration_error", err.to_string()), Utc::now())?;
                    self.store.update_job(&job).await?;
                    return Err(OrchestratorError::from(err));
                }
            };

            job.start(Utc::now())?;
            self.store.update_job(&job).await?;
            let started_at = job.started_at.unwrap_or(job.created_at);

            let ctx = CollectorContext::new(domain.clone(), collector.as_ref(), self.store.clone(), self.gauge.clone())
                .with_job_id(job.id);
            let config = job.config.clone();
            let run: JoinHandle<_> = tokio::spawn(
                async move {
                    // ctx is dropped with this task on every exit path
                    let ctx = ctx;
                    collector.collect(&ctx, &config).await
                }
                .in_current_span(),
            );
            self.in_flight().insert(job.id, run.abort_handle());
            let joined = run.await;
            self.in_flight().remove(&job.id);

            let now = Utc::now();
            let (result, failure) = match joined {
                Ok(Ok(result)) => (result, None),
                Ok(Err(err)) => {
                    error!(error = %err, error_type = err.error_type(), "collection failed");
                    let failure = err.to_failure();
                    (
                        CollectionResult::failed_run(&domain, &job.source, started_at, &failure.message, now),
                        Some(failure),
                    )
                }
                Err(join_err) => {
                    let failure = join_failure(&join_err);
                    error!(error_type = %failure.error_type, "collector task ended abnormally");
                    (
                        CollectionResult::failed_run(&domain, &job.source, started_at, &failure.message, now),
                        Some(failure),
                    )
                }
            };

            self.finalize(job, &result, failure).await?;
            Ok::<_, OrchestratorError>(result)
        }
        .instrument(span)
        .await
    }

    async fn finalize(
        &self,
        mut job: Job,
        result: &CollectionResult,
        failure: Option<JobFailure>,
    ) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        match failure {
            Some(failure) => job.fail(failure, now)?,
            None => job.finish(result, now)?,
        }
        if !self.store.update_job_if(&job, JobStatus::Running).await? {
            warn!("job already finalized out of band, keeping stored state");
            return Ok(());
        }
        info!(
            status = %job.status,
            processed = job.records_processed,
            inserted = job.rows_inserted,
            updated = job.rows_updated,
            failed = job.records_failed,
            "job finalized"
        );

        // a partial run leaves the boundary where it was so failed items are fetched again
        if result.status == CollectionStatus::Success {
            if let Some(domain) = &job.domain {
                let region = job.config.get("region").and_then(JsonValue::as_str);
                let update = WatermarkUpdate {
                    key: WatermarkKey::new(domain.as_str(), job.source.as_str(), region),
                    collected_at: job.completed_at.unwrap_or(now),
                    job_id: Some(job.id),
                    records_collected: i64::try_from(result.processed).ok(),
                };
                self.store.upsert_watermark(&update).await?;
            }
        }
        Ok(())
    }

    /// Spawn an already persisted pending job.
    pub fn dispatch(&self, job: Job) -> JobHandle {
        let job_id = job.id;
        let this = self.clone();
        let join = tokio::spawn(async move { this.execute_job(job).await });
        JobHandle { job_id, join }
    }

    pub async fn submit_job(&self, job: Job) -> Result<JobHandle, OrchestratorError> {
        self.store.insert_job(&job).await?;
        Ok(self.dispatch(job))
    }

    pub async fn submit(
        &self,
        domain: Option<&str>,
        source: &str,
        config: ConfigMap,
    ) -> Result<JobHandle, OrchestratorError> {
        let job = self.create_job(domain, source, config).await?;
        Ok(self.dispatch(job))
    }

    pub async fn run_one(
        &self,
        domain: &str,
        source: &str,
        config: ConfigMap,
    ) -> Result<CollectionResult, OrchestratorError> {
        let job = self.create_job(Some(domain), source, config).await?;
        self.execute_job(job).await
    }

    /// Run the domain's sources one after another (or `sources` in the given
    /// order). A failing source does not stop the rest.
    pub async fn run_domain(
        &self,
        domain: &str,
        sources: Option<&[String]>,
    ) -> Result<DomainRunReport, OrchestratorError> {
        let sources: Vec<String> = match sources {
            Some(list) => list.to_vec(),
            None => self
                .domains
                .sources_for(domain)
                .ok_or_else(|| OrchestratorError::UnknownDomain(domain.to_string()))?
                .to_vec(),
        };

        let started_at = Utc::now();
        info!(domain, sources = sources.len(), "domain run started");
        let mut runs = Vec::with_capacity(sources.len());
        for source in sources {
            let outcome = match self.run_one(domain, &source, ConfigMap::new()).await {
                Ok(result) => SourceOutcome::Completed { result },
                Err(err) => {
                    warn!(domain, source = %source, error = %err, "source run errored");
                    SourceOutcome::Errored {
                        message: err.to_string(),
                    }
                }
            };
            runs.push(SourceRun { source, outcome });
        }

        let report = DomainRunReport {
            domain: domain.to_string(),
            started_at,
            completed_at: Utc::now(),
            sources: runs,
            error: None,
        };
        info!(domain, succeeded = report.succeeded(), total = report.sources.len(), "domain run finished");
        Ok(report)
    }

    /// Domains strictly in order with the configured pause between them.
    pub async fn run_full_sync(&self, domains: Option<&[String]>) -> FullSyncReport {
        let targets: Vec<String> = match domains {
            Some(list) => list.to_vec(),
            None => self.domains.names().map(ToString::to_string).collect(),
        };
        let delay: Duration = self.config.domain_delay;

        let mut reports = Vec::with_capacity(targets.len());
        for (index, domain) in targets.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                info!(delay_secs = delay.as_secs_f64(), next = %domain, "pausing between domains");
                tokio::time::sleep(delay).await;
            }
            let report = match self.run_domain(domain, None).await {
                Ok(report) => report,
                Err(err) => {
                    error!(domain = %domain, error = %err, "domain run failed");
                    let now = Utc::now();
                    DomainRunReport {
                        domain: domain.clone(),
                        started_at: now,
                        completed_at: now,
                        sources: Vec::new(),
                        error: Some(err.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        FullSyncReport { domains: reports }
    }
}
