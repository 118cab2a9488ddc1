use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use harvest_collectors::{
    default_registry, ClientGauge, CollectError, Collector, CollectorContext, CollectorSettings, PageRequest,
};
use harvest_core::{CollectionStatus, ConfigMap};
use harvest_storage::{BackoffPolicy, FetchError, HttpMethod, MemoryStore, Store, UpsertCounts};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Hits {
    flaky: Arc<AtomicUsize>,
    missing: Arc<AtomicUsize>,
    limited: Arc<AtomicUsize>,
    pages: Arc<AtomicUsize>,
}

async fn flaky(State(hits): State<Hits>) -> Response {
    let n = hits.flaky.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        StatusCode::TOO_MANY_REQUESTS.into_response()
    } else {
        Json(json!({ "ok": true })).into_response()
    }
}

async fn missing(State(hits): State<Hits>) -> Response {
    hits.missing.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND.into_response()
}

async fn limited(State(hits): State<Hits>) -> Response {
    hits.limited.fetch_add(1, Ordering::SeqCst);
    StatusCode::TOO_MANY_REQUESTS.into_response()
}

/// Five works served two per page.
async fn works(State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    hits.pages.fetch_add(1, Ordering::SeqCst);
    let page: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let per_page: usize = q.get("per-page").and_then(|p| p.parse().ok()).unwrap_or(2);
    let all: Vec<Value> = (1..=5)
        .map(|i| json!({ "id": format!("W{i}"), "title": format!("work {i}"), "host": { "name": "x" } }))
        .collect();
    let start = (page - 1) * per_page;
    let slice: Vec<Value> = all.into_iter().skip(start).take(per_page).collect();
    Json(json!({ "meta": { "page": page }, "results": slice }))
}

async fn spawn_server() -> (String, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/flaky", get(flaky))
        .route("/missing", get(missing))
        .route("/limited", get(limited))
        .route("/works", get(works))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn fast_settings(base_url: &str) -> CollectorSettings {
    CollectorSettings {
        base_url: Some(base_url.to_string()),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        rate_limit_delay: Duration::ZERO,
        ..CollectorSettings::default()
    }
}

fn context_for(base_url: &str, store: Arc<dyn Store>, gauge: ClientGauge) -> (Box<dyn Collector>, CollectorContext) {
    context_with(fast_settings(base_url), store, gauge)
}

fn context_with(
    settings: CollectorSettings,
    store: Arc<dyn Store>,
    gauge: ClientGauge,
) -> (Box<dyn Collector>, CollectorContext) {
    let collector = default_registry().create("openalex", settings).unwrap();
    let ctx = CollectorContext::new("research", collector.as_ref(), store, gauge);
    (collector, ctx)
}

fn record(value: Value) -> ConfigMap {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn rate_limited_requests_are_retried_until_success() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let body = ctx
        .fetch_json("/flaky", &ConfigMap::new(), HttpMethod::Get)
        .await
        .unwrap();
    assert_eq!(body, json!({ "ok": true }));
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let err = ctx
        .fetch_json("/missing", &ConfigMap::new(), HttpMethod::Get)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    assert_eq!(hits.missing.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_rate_limit_exhausts_retries() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let err = ctx
        .fetch_json("/limited", &ConfigMap::new(), HttpMethod::Get)
        .await
        .unwrap_err();
    match err {
        FetchError::RetriesExhausted { url, attempts } => {
            assert!(url.ends_with("/limited"));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hits.limited.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pagination_stops_on_short_page() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let mut request = PageRequest::new("works", "results");
    request.page_size_param = "per-page".into();
    request.params.insert("per-page".into(), json!(2));
    let items = ctx.fetch_all_pages(request).await.unwrap();

    let ids: Vec<&str> = items.iter().filter_map(|i| i["id"].as_str()).collect();
    assert_eq!(ids, vec!["W1", "W2", "W3", "W4", "W5"]);
    assert_eq!(hits.pages.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pagination_stops_on_empty_page() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let mut request = PageRequest::new("works", "results");
    request.page_size_param = "per-page".into();
    request.params.insert("per-page".into(), json!(5));
    let items = ctx.fetch_all_pages(request).await.unwrap();

    assert_eq!(items.len(), 5);
    assert_eq!(hits.pages.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pagination_pauses_between_pages() {
    let (base, hits) = spawn_server().await;
    let settings = CollectorSettings {
        rate_limit_delay: Duration::from_millis(40),
        ..fast_settings(&base)
    };
    let (_collector, ctx) = context_with(settings, Arc::new(MemoryStore::new()), ClientGauge::new());

    let mut request = PageRequest::new("works", "results");
    request.page_size_param = "per-page".into();
    request.params.insert("per-page".into(), json!(2));
    let started = Instant::now();
    let items = ctx.fetch_all_pages(request).await.unwrap();

    assert_eq!(items.len(), 5);
    assert_eq!(hits.pages.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(80), "{:?}", started.elapsed());
}

#[tokio::test]
async fn pagination_respects_max_pages() {
    let (base, hits) = spawn_server().await;
    let (_collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());

    let mut request = PageRequest::new("works", "results");
    request.page_size_param = "per-page".into();
    request.params.insert("per-page".into(), json!(2));
    request.max_pages = Some(1);
    let items = ctx.fetch_all_pages(request).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(hits.pages.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn collect_upserts_idempotently_and_releases_client() {
    let (base, _hits) = spawn_server().await;
    let store = Arc::new(MemoryStore::new());
    let gauge = ClientGauge::new();
    let config: ConfigMap = json!({ "params": { "per-page": 2 } }).as_object().cloned().unwrap();

    for round in 0..2 {
        let (collector, ctx) = context_for(&base, store.clone(), gauge.clone());
        let result = collector.collect(&ctx, &config).await.unwrap();
        assert_eq!(result.status, CollectionStatus::Success);
        assert_eq!(result.processed, 5);
        if round == 0 {
            assert_eq!((result.inserted, result.updated), (5, 0));
        } else {
            assert_eq!((result.inserted, result.updated), (0, 5));
        }
        assert_eq!(result.sample.len(), 5);
        assert_eq!(gauge.open_clients(), 1);
        drop(ctx);
        assert_eq!(gauge.open_clients(), 0);
    }

    let rows = store.table_rows("research_works").await;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].get("host_name"), Some(&json!("x")));
}

#[tokio::test]
async fn null_preserving_upsert_fills_gaps_without_clearing() {
    let store = Arc::new(MemoryStore::new());
    let (_collector, ctx) = context_for("http://127.0.0.1:9", store.clone(), ClientGauge::new());

    ctx.bulk_upsert(
        "research_works",
        &[record(json!({ "id": "W1", "title": "Soil carbon", "abstract": null }))],
        &["id"],
        None,
    )
    .await
    .unwrap();
    let counts = ctx
        .null_preserving_upsert(
            "research_works",
            &[record(json!({ "id": "W1", "title": null, "abstract": "Measured at depth" }))],
            &["id"],
            &["title", "abstract"],
        )
        .await
        .unwrap();
    assert_eq!(counts, UpsertCounts { inserted: 0, updated: 1 });

    let rows = store.table_rows("research_works").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&json!("Soil carbon")));
    assert_eq!(rows[0].get("abstract"), Some(&json!("Measured at depth")));
    assert!(!ctx.client_open());
}

#[tokio::test]
async fn fetch_failure_surfaces_as_collect_error() {
    let (base, _hits) = spawn_server().await;
    let (collector, ctx) = context_for(&base, Arc::new(MemoryStore::new()), ClientGauge::new());
    let config: ConfigMap = json!({ "endpoint": "missing" }).as_object().cloned().unwrap();

    let err = collector.collect(&ctx, &config).await.unwrap_err();
    assert!(matches!(err, CollectError::Fetch(FetchError::HttpStatus { status: 404, .. })));
    assert_eq!(err.error_type(), "http_error");
}
