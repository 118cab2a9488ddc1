use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use harvest_core::ConfigMap;
use harvest_storage::{
    FetchError, HttpClient, HttpClientConfig, HttpMethod, Store, StoreError, UpsertCounts, UpsertMode,
    UpsertTarget,
};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CollectError, Collector, CollectorSettings};

/// Records per upsert statement.
pub const UPSERT_BATCH_SIZE: usize = 500;

const DEFAULT_PAGE_SIZE: u64 = 100;

/// Count of outbound clients currently alive across every collector run.
#[derive(Debug, Clone, Default)]
pub struct ClientGauge(Arc<AtomicUsize>);

impl ClientGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_clients(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> ClientLease {
        self.0.fetch_add(1, Ordering::SeqCst);
        ClientLease(self.0.clone())
    }
}

#[derive(Debug)]
struct ClientLease(Arc<AtomicUsize>);

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct LeasedClient {
    client: HttpClient,
    _lease: ClientLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    /// The cursor param carries a 1-based page number.
    PageNumber,
    /// The cursor param carries a record offset advanced by the page size.
    Offset,
}

/// One paginated listing walk.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub endpoint: String,
    pub params: ConfigMap,
    pub method: HttpMethod,
    pub page_size_param: String,
    pub page_param: String,
    pub cursor: PageCursor,
    /// Dotted path to the item array; numeric segments index arrays.
    pub items_key: String,
    pub max_pages: Option<u32>,
}

impl PageRequest {
    pub fn new(endpoint: impl Into<String>, items_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: ConfigMap::new(),
            method: HttpMethod::Get,
            page_size_param: "per_page".to_string(),
            page_param: "page".to_string(),
            cursor: PageCursor::PageNumber,
            items_key: items_key.into(),
            max_pages: None,
        }
    }

    fn page_size(&self) -> u64 {
        self.params
            .get(&self.page_size_param)
            .and_then(json_as_u64)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn first_cursor(&self) -> u64 {
        let default = match self.cursor {
            PageCursor::PageNumber => 1,
            PageCursor::Offset => 0,
        };
        self.params
            .get(&self.page_param)
            .and_then(json_as_u64)
            .unwrap_or(default)
    }
}

fn json_as_u64(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Resolve a dotted path such as `results` or `1` or `data.items`.
pub fn lookup_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Per-run environment handed to [`Collector::collect`].
///
/// Owns the collector's outbound client, built on first use. Dropping the
/// context releases the client whichever way the run ended.
pub struct CollectorContext {
    domain: String,
    source: String,
    job_id: Option<Uuid>,
    client_config: HttpClientConfig,
    rate_limit_delay: std::time::Duration,
    store: Arc<dyn Store>,
    gauge: ClientGauge,
    client: OnceCell<LeasedClient>,
}

impl std::fmt::Debug for CollectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorContext")
            .field("domain", &self.domain)
            .field("source", &self.source)
            .field("job_id", &self.job_id)
            .field("client_open", &self.client.initialized())
            .finish()
    }
}

impl CollectorContext {
    pub fn new(
        domain: impl Into<String>,
        collector: &dyn Collector,
        store: Arc<dyn Store>,
        gauge: ClientGauge,
    ) -> Self {
        let settings: &CollectorSettings = collector.settings();
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| collector.default_endpoint().to_string());
        let client_config = HttpClientConfig {
            base_url: Some(base_url),
            timeout: settings.timeout,
            user_agent: settings.user_agent.clone(),
            default_headers: collector.default_headers(),
            backoff: settings.backoff,
            limiter: settings.limiter.clone(),
        };
        Self {
            domain: domain.into(),
            source: collector.source_id().to_string(),
            job_id: None,
            client_config,
            rate_limit_delay: settings.rate_limit_delay,
            store,
            gauge,
            client: OnceCell::new(),
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.job_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn client_open(&self) -> bool {
        self.client.initialized()
    }

    async fn client(&self) -> Result<&HttpClient, FetchError> {
        let leased = self
            .client
            .get_or_try_init(|| async {
                let client = HttpClient::new(self.client_config.clone())?;
                debug!(source = %self.source, "opened http client");
                Ok::<_, FetchError>(LeasedClient {
                    client,
                    _lease: self.gauge.acquire(),
                })
            })
            .await?;
        Ok(&leased.client)
    }

    pub async fn fetch_json(
        &self,
        endpoint: &str,
        params: &ConfigMap,
        method: HttpMethod,
    ) -> Result<JsonValue, FetchError> {
        self.client().await?.fetch_json(endpoint, params, method).await
    }

    /// Walk pages in order until a short page, an empty page or `max_pages`.
    pub async fn fetch_all_pages(&self, request: PageRequest) -> Result<Vec<JsonValue>, CollectError> {
        let page_size = request.page_size();
        let mut cursor = request.first_cursor();
        let mut params = request.params.clone();
        params.insert(request.page_size_param.clone(), JsonValue::from(page_size));

        let mut items = Vec::new();
        let mut pages = 0u32;
        loop {
            params.insert(request.page_param.clone(), JsonValue::from(cursor));
            let body = self.fetch_json(&request.endpoint, &params, request.method).await?;
            let page_items = match lookup_path(&body, &request.items_key) {
                Some(JsonValue::Array(list)) => list.clone(),
                Some(JsonValue::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(CollectError::Config(format!(
                        "{} did not resolve to an array in the response",
                        request.items_key
                    )))
                }
            };
            pages += 1;
            let count = page_items.len() as u64;
            debug!(source = %self.source, page = pages, count, "fetched page");
            items.extend(page_items);

            if count == 0 || count < page_size {
                break;
            }
            if request.max_pages.is_some_and(|max| pages >= max) {
                break;
            }
            cursor = match request.cursor {
                PageCursor::PageNumber => cursor + 1,
                PageCursor::Offset => cursor + page_size,
            };
            if !self.rate_limit_delay.is_zero() {
                tokio::time::sleep(self.rate_limit_delay).await;
            }
        }
        info!(source = %self.source, pages, items = items.len(), "pagination complete");
        Ok(items)
    }

    /// Insert-or-update by `unique_keys` in fixed-size batches. `update_keys`
    /// of `None` updates every non-key field.
    pub async fn bulk_upsert(
        &self,
        table: &str,
        records: &[ConfigMap],
        unique_keys: &[&str],
        update_keys: Option<&[&str]>,
    ) -> Result<UpsertCounts, StoreError> {
        self.upsert_batched(table, records, unique_keys, update_keys, UpsertMode::Overwrite)
            .await
    }

    /// Like [`bulk_upsert`](Self::bulk_upsert) but an incoming null never
    /// clears a stored value.
    pub async fn null_preserving_upsert(
        &self,
        table: &str,
        records: &[ConfigMap],
        unique_keys: &[&str],
        update_keys: &[&str],
    ) -> Result<UpsertCounts, StoreError> {
        self.upsert_batched(
            table,
            records,
            unique_keys,
            Some(update_keys),
            UpsertMode::PreserveNonNull,
        )
        .await
    }

    async fn upsert_batched(
        &self,
        table: &str,
        records: &[ConfigMap],
        unique_keys: &[&str],
        update_keys: Option<&[&str]>,
        mode: UpsertMode,
    ) -> Result<UpsertCounts, StoreError> {
        let mut totals = UpsertCounts::default();
        for batch in records.chunks(UPSERT_BATCH_SIZE) {
            let target = UpsertTarget {
                table,
                unique_keys,
                update_keys,
                mode,
            };
            totals += self.store.upsert_records(target, batch).await?;
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let body = json!([{ "page": 1 }, [{ "id": "a" }]]);
        assert_eq!(lookup_path(&body, "1").and_then(|v| v.as_array()).map(Vec::len), Some(1));
        assert_eq!(lookup_path(&body, "0.page"), Some(&json!(1)));
        assert_eq!(lookup_path(&body, "2"), None);

        let nested = json!({ "data": { "items": [] } });
        assert_eq!(lookup_path(&nested, "data.items"), Some(&json!([])));
    }

    #[test]
    fn page_request_reads_size_and_start_from_params() {
        let mut request = PageRequest::new("works", "results");
        request.params.insert("per_page".into(), json!("25"));
        request.params.insert("page".into(), json!(3));
        assert_eq!(request.page_size(), 25);
        assert_eq!(request.first_cursor(), 3);

        let mut offset = PageRequest::new("search", "data");
        offset.cursor = PageCursor::Offset;
        offset.page_param = "offset".into();
        assert_eq!(offset.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(offset.first_cursor(), 0);
    }

    #[test]
    fn gauge_tracks_leases() {
        let gauge = ClientGauge::new();
        let a = gauge.acquire();
        let b = gauge.acquire();
        assert_eq!(gauge.open_clients(), 2);
        drop(a);
        assert_eq!(gauge.open_clients(), 1);
        drop(b);
        assert_eq!(gauge.open_clients(), 0);
    }
}
