//! Collector contract and registry.
//!
//! A collector is thin glue around one external source: fetch pages, shape
//! records, upsert them. Everything shared (HTTP with backoff, pagination,
//! batched upserts) lives on [`CollectorContext`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{CollectionResult, ConfigMap, JobFailure};
use harvest_storage::{BackoffPolicy, FetchError, SimpleTokenBucket, StoreError};
use thiserror::Error;

mod context;
mod paged_json;

pub use context::{lookup_path, ClientGauge, CollectorContext, PageCursor, PageRequest, UPSERT_BATCH_SIZE};
pub use paged_json::{default_registry, flatten_record, PagedJsonCollector, PagedJsonSource, DEFAULT_SOURCES};

pub const CRATE_NAME: &str = "harvest-collectors";

/// Immutable per-construction knobs for one collector instance.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Replaces the collector's default endpoint when set.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Fixed pause between page requests.
    pub rate_limit_delay: Duration,
    /// Optional budget shared with other collectors hitting the same provider.
    pub limiter: Option<Arc<SimpleTokenBucket>>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("harvest/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
            rate_limit_delay: Duration::from_millis(500),
            limiter: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

impl CollectError {
    pub fn error_type(&self) -> &'static str {
        match self {
            CollectError::Config(_) => "configuration_error",
            CollectError::Fetch(FetchError::RetriesExhausted { .. }) => "retries_exhausted",
            CollectError::Fetch(FetchError::HttpStatus { .. }) => "http_error",
            CollectError::Fetch(_) => "fetch_error",
            CollectError::Store(_) => "store_error",
            CollectError::Other(_) => "collection_error",
        }
    }

    /// Configuration mistakes and 4xx answers will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectError::Config(_) => false,
            CollectError::Fetch(FetchError::HttpStatus { status, .. }) => *status >= 500,
            CollectError::Fetch(FetchError::InvalidHeader(_)) => false,
            CollectError::Store(StoreError::InvalidIdentifier(_) | StoreError::MissingKey(_)) => false,
            _ => true,
        }
    }

    pub fn to_failure(&self) -> JobFailure {
        let message = self.to_string();
        if self.is_retryable() {
            JobFailure::retryable(self.error_type(), message)
        } else {
            JobFailure::permanent(self.error_type(), message)
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> &str;

    fn settings(&self) -> &CollectorSettings;

    /// Base URL used when the settings carry no override.
    fn default_endpoint(&self) -> &str;

    fn default_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn collect(&self, ctx: &CollectorContext, config: &ConfigMap) -> Result<CollectionResult, CollectError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no collector registered for source {0:?}")]
    NoCollectorRegistered(String),
}

pub type CollectorFactory = Arc<dyn Fn(CollectorSettings) -> Box<dyn Collector> + Send + Sync>;

/// Source id → collector factory. Populated explicitly, never discovered.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    factories: BTreeMap<String, CollectorFactory>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("sources", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, source: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(CollectorSettings) -> Box<dyn Collector> + Send + Sync + 'static,
    {
        self.factories.insert(source.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, source: &str) -> bool {
        self.factories.contains_key(source)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, source: &str, settings: CollectorSettings) -> Result<Box<dyn Collector>, RegistryError> {
        let factory = self
            .factories
            .get(source)
            .ok_or_else(|| RegistryError::NoCollectorRegistered(source.to_string()))?;
        Ok(factory(settings))
    }
}
