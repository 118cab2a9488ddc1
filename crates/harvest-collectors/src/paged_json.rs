use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{CollectionResult, ConfigMap};
use harvest_storage::HttpMethod;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, Instrument};

use crate::{CollectError, Collector, CollectorContext, CollectorRegistry, CollectorSettings, PageCursor, PageRequest};

/// Job config keys that steer the collector rather than the request.
const CONTROL_KEYS: &[&str] = &["endpoint", "table", "max_pages", "params", "incremental", "region"];

/// Static description of a paginated JSON listing.
#[derive(Debug, Clone, Copy)]
pub struct PagedJsonSource {
    pub source_id: &'static str,
    pub base_url: &'static str,
    pub endpoint: &'static str,
    pub method: HttpMethod,
    pub items_key: &'static str,
    pub page_size_param: &'static str,
    pub page_param: &'static str,
    pub cursor: PageCursor,
    pub page_size: u64,
    pub table: &'static str,
    pub unique_keys: &'static [&'static str],
    /// Query/body field carrying the api key; the key is then mandatory.
    pub api_key_param: Option<&'static str>,
    pub default_params: &'static [(&'static str, &'static str)],
    /// Request params copied onto every record (e.g. the series an
    /// observation belongs to).
    pub context_fields: &'static [&'static str],
}

pub const DEFAULT_SOURCES: &[PagedJsonSource] = &[
    PagedJsonSource {
        source_id: "openalex",
        base_url: "https://api.openalex.org",
        endpoint: "works",
        method: HttpMethod::Get,
        items_key: "results",
        page_size_param: "per-page",
        page_param: "page",
        cursor: PageCursor::PageNumber,
        page_size: 200,
        table: "research_works",
        unique_keys: &["id"],
        api_key_param: None,
        default_params: &[],
        context_fields: &[],
    },
    PagedJsonSource {
        source_id: "nih_reporter",
        base_url: "https://api.reporter.nih.gov/v2",
        endpoint: "projects/search",
        method: HttpMethod::Post,
        items_key: "results",
        page_size_param: "limit",
        page_param: "offset",
        cursor: PageCursor::Offset,
        page_size: 500,
        table: "research_projects",
        unique_keys: &["appl_id"],
        api_key_param: None,
        default_params: &[],
        context_fields: &[],
    },
    PagedJsonSource {
        source_id: "fred",
        base_url: "https://api.stlouisfed.org/fred",
        endpoint: "series/observations",
        method: HttpMethod::Get,
        items_key: "observations",
        page_size_param: "limit",
        page_param: "offset",
        cursor: PageCursor::Offset,
        page_size: 1000,
        table: "economic_observations",
        unique_keys: &["series_id", "date"],
        api_key_param: Some("api_key"),
        default_params: &[("file_type", "json")],
        context_fields: &["series_id"],
    },
    PagedJsonSource {
        source_id: "worldbank",
        base_url: "https://api.worldbank.org/v2",
        endpoint: "country/all/indicator/NY.GDP.MKTP.CD",
        method: HttpMethod::Get,
        items_key: "1",
        page_size_param: "per_page",
        page_param: "page",
        cursor: PageCursor::PageNumber,
        page_size: 1000,
        table: "economic_indicators",
        unique_keys: &["indicator_id", "country_id", "date"],
        api_key_param: None,
        default_params: &[("format", "json")],
        context_fields: &[],
    },
    PagedJsonSource {
        source_id: "usaspending",
        base_url: "https://api.usaspending.gov/api/v2",
        endpoint: "search/spending_by_award/",
        method: HttpMethod::Post,
        items_key: "results",
        page_size_param: "limit",
        page_param: "page",
        cursor: PageCursor::PageNumber,
        page_size: 100,
        table: "contract_awards",
        unique_keys: &["generated_internal_id"],
        api_key_param: None,
        default_params: &[],
        context_fields: &[],
    },
    PagedJsonSource {
        source_id: "sam_gov",
        base_url: "https://api.sam.gov/opportunities/v2",
        endpoint: "search",
        method: HttpMethod::Get,
        items_key: "opportunitiesData",
        page_size_param: "limit",
        page_param: "offset",
        cursor: PageCursor::Offset,
        page_size: 1000,
        table: "contract_opportunities",
        unique_keys: &["noticeId"],
        api_key_param: Some("api_key"),
        default_params: &[],
        context_fields: &[],
    },
];

/// Lift one level of nested objects into `parent_child` fields.
pub fn flatten_record(item: &ConfigMap) -> ConfigMap {
    let mut out = ConfigMap::new();
    for (key, value) in item {
        match value {
            JsonValue::Object(inner) => {
                for (inner_key, inner_value) in inner {
                    out.insert(format!("{key}_{inner_key}"), inner_value.clone());
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

/// Config-driven collector for sources that are a plain paginated JSON list.
#[derive(Debug, Clone)]
pub struct PagedJsonCollector {
    source: PagedJsonSource,
    settings: CollectorSettings,
}

impl PagedJsonCollector {
    pub fn new(source: PagedJsonSource, settings: CollectorSettings) -> Self {
        Self { source, settings }
    }

    fn request_params(&self, config: &ConfigMap) -> Result<ConfigMap, CollectError> {
        let mut params = ConfigMap::new();
        for (key, value) in self.source.default_params {
            params.insert((*key).to_string(), JsonValue::from(*value));
        }
        params.insert(
            self.source.page_size_param.to_string(),
            JsonValue::from(self.source.page_size),
        );

        match config.get("params") {
            Some(JsonValue::Object(extra)) => {
                params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(JsonValue::Null) | None => {}
            Some(_) => return Err(CollectError::Config("params must be a JSON object".into())),
        }
        for (key, value) in config {
            if !CONTROL_KEYS.contains(&key.as_str()) {
                params.insert(key.clone(), value.clone());
            }
        }

        if let Some(param) = self.source.api_key_param {
            let key = self.settings.api_key.as_deref().ok_or_else(|| {
                CollectError::Config(format!("{} requires an api key", self.source.source_id))
            })?;
            params.insert(param.to_string(), JsonValue::from(key));
        }
        Ok(params)
    }

    fn page_request(&self, config: &ConfigMap, params: ConfigMap) -> Result<PageRequest, CollectError> {
        let endpoint = match config.get("endpoint") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(_) => return Err(CollectError::Config("endpoint must be a string".into())),
            None => self.source.endpoint.to_string(),
        };
        let max_pages = match config.get("max_pages") {
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| CollectError::Config("max_pages must be a positive integer".into()))?,
            ),
            None => None,
        };
        Ok(PageRequest {
            endpoint,
            params,
            method: self.source.method,
            page_size_param: self.source.page_size_param.to_string(),
            page_param: self.source.page_param.to_string(),
            cursor: self.source.cursor,
            items_key: self.source.items_key.to_string(),
            max_pages,
        })
    }
}

fn item_label(record: &ConfigMap, unique_keys: &[&str]) -> Option<String> {
    let parts: Vec<String> = unique_keys
        .iter()
        .filter_map(|k| record.get(*k))
        .filter(|v| !v.is_null())
        .map(|v| v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string()))
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[async_trait]
impl Collector for PagedJsonCollector {
    fn source_id(&self) -> &str {
        self.source.source_id
    }

    fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    fn default_endpoint(&self) -> &str {
        self.source.base_url
    }

    fn default_headers(&self) -> Vec<(String, String)> {
        vec![("accept".to_string(), "application/json".to_string())]
    }

    async fn collect(&self, ctx: &CollectorContext, config: &ConfigMap) -> Result<CollectionResult, CollectError> {
        let span = info_span!("collect", source = self.source.source_id, domain = %ctx.domain());
        async {
            let mut result = CollectionResult::begin(ctx.domain(), self.source.source_id, Utc::now());
            let table = match config.get("table") {
                Some(JsonValue::String(t)) => t.clone(),
                Some(_) => return Err(CollectError::Config("table must be a string".into())),
                None => self.source.table.to_string(),
            };
            let params = self.request_params(config)?;
            let context_values: Vec<(&str, JsonValue)> = self
                .source
                .context_fields
                .iter()
                .filter_map(|f| params.get(*f).map(|v| (*f, v.clone())))
                .collect();

            let items = ctx.fetch_all_pages(self.page_request(config, params)?).await?;
            result.record_fetched(items.len() as u64);

            let unique_keys = self.source.unique_keys;
            let mut records = Vec::with_capacity(items.len());
            for item in items {
                let JsonValue::Object(map) = item else {
                    result.record_failure(None, "item is not a JSON object");
                    continue;
                };
                let mut record = flatten_record(&map);
                for (field, value) in &context_values {
                    record.entry(field.to_string()).or_insert_with(|| value.clone());
                }
                if let Some(missing) = unique_keys
                    .iter()
                    .find(|k| record.get(**k).map_or(true, JsonValue::is_null))
                {
                    result.record_failure(item_label(&record, unique_keys), format!("missing key field {missing}"));
                    continue;
                }
                result.push_sample(JsonValue::Object(record.clone()));
                records.push(record);
            }

            let counts = ctx.bulk_upsert(&table, &records, unique_keys, None).await?;
            result.record_upsert(counts.inserted, counts.updated);
            let result = result.finish(Utc::now());
            info!(
                status = ?result.status,
                inserted = result.inserted,
                updated = result.updated,
                failed = result.failed,
                "collection finished"
            );
            Ok::<_, CollectError>(result)
        }
        .instrument(span)
        .await
    }
}

pub fn default_registry() -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();
    for source in DEFAULT_SOURCES {
        let source = *source;
        registry.register(source.source_id, move |settings| {
            Box::new(PagedJsonCollector::new(source, settings)) as Box<dyn Collector>
        });
    }
    registry
}
