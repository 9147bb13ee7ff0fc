//! End-to-end scenarios: HTTP intake through the log and processor into the
//! store, then back out through the stats endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sitepulse::api::{self, ApiState};
use sitepulse::config::ProcessorConfig;
use sitepulse::event::Event;
use sitepulse::ingress::Ingress;
use sitepulse::processor::Processor;
use sitepulse::queue::memory::{MemoryLog, MemoryProducer};
use sitepulse::store::memory::MemoryStore;
use sitepulse::store::{DayWindow, EventStore, PathViews, SiteStats};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Memory store that fails a fixed number of inserts before succeeding.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl EventStore for FlakyStore {
    async fn insert_event(&self, event: &Event) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("connection refused");
        }
        self.inner.insert_event(event).await
    }

    async fn site_stats(&self, site_id: &str, window: DayWindow) -> Result<SiteStats> {
        self.inner.site_stats(site_id, window).await
    }

    async fn top_paths(&self, site_id: &str, window: DayWindow) -> Result<Vec<PathViews>> {
        self.inner.top_paths(site_id, window).await
    }
}

struct Pipeline {
    app: Router,
    log: MemoryLog,
    store: Arc<FlakyStore>,
    cancel: CancellationToken,
    processor: JoinHandle<Result<()>>,
}

impl Pipeline {
    fn start(store_failures: usize) -> Self {
        let log = MemoryLog::new(2);
        let store = Arc::new(FlakyStore {
            failures: AtomicUsize::new(store_failures),
            ..Default::default()
        });

        let state: Arc<ApiState<MemoryProducer, FlakyStore>> = Arc::new(ApiState {
            ingress: Ingress::new(log.producer(), Duration::from_secs(1)),
            store: Arc::clone(&store),
            health: None,
        });

        let cfg = ProcessorConfig {
            workers: 1,
            fetch_backoff: Duration::from_millis(10),
            commit_interval: Duration::ZERO,
        };
        let cancel = CancellationToken::new();
        let processor = tokio::spawn(
            Processor::new(log.consumer("analytics-processor"), Arc::clone(&store), &cfg)
                .run(cancel.clone()),
        );

        Self {
            app: api::router(state),
            log,
            store,
            cancel,
            processor,
        }
    }

    async fn post(&self, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.call(req).await
    }

    async fn stats(&self, site_id: &str, date: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .uri(format!("/stats?site_id={site_id}&date={date}"))
            .body(Body::empty())
            .unwrap();
        self.call(req).await
    }

    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_persisted(&self, n: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.store.inner.len() < n {
            assert!(std::time::Instant::now() < deadline, "only {} rows", self.store.inner.len());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.processor.await.unwrap().unwrap();
    }
}

fn page_view(site_id: &str, path: &str, user_id: &str) -> Value {
    json!({
        "site_id": site_id,
        "event_type": "page_view",
        "path": path,
        "user_id": user_id,
        "timestamp": "2024-01-01T10:00:00Z"
    })
}

#[tokio::test]
async fn test_single_page_view_end_to_end() {
    let pipeline = Pipeline::start(0);

    let (status, body) = pipeline.post(page_view("s1", "/home", "u1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "message": "Event accepted" }));

    pipeline.wait_persisted(1).await;

    let (status, body) = pipeline.stats("s1", "2024-01-01").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "site_id": "s1",
            "date": "2024-01-01",
            "total_views": 1,
            "unique_users": 1,
            "top_paths": [{ "path": "/home", "views": 1 }]
        })
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn test_empty_site_id_enqueues_nothing() {
    let pipeline = Pipeline::start(0);

    let (status, body) = pipeline.post(page_view("", "/home", "u1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("site_id"));
    assert!(pipeline.log.is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_stats_for_unknown_site_are_zero() {
    let pipeline = Pipeline::start(0);

    let (status, body) = pipeline.stats("nobody", "2024-01-01").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_views"], 0);
    assert_eq!(body["unique_users"], 0);
    assert_eq!(body["top_paths"], json!([]));

    pipeline.stop().await;
}

#[tokio::test]
async fn test_transient_store_failure_yields_one_row() {
    let pipeline = Pipeline::start(2);

    let (status, _) = pipeline.post(page_view("s1", "/home", "u1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    pipeline.wait_persisted(1).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while pipeline.log.committed_offset("analytics-processor", 0).is_none() {
        assert!(std::time::Instant::now() < deadline, "offset never committed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (_, body) = pipeline.stats("s1", "2024-01-01").await;
    assert_eq!(body["total_views"], 1);
    assert_eq!(pipeline.store.inner.len(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_top_paths_are_sorted_and_deterministic() {
    let pipeline = Pipeline::start(0);

    let visits = [
        ("/pricing", "u1"),
        ("/docs", "u2"),
        ("/home", "u1"),
        ("/docs", "u3"),
        ("/home", "u2"),
        ("/home", ""),
        ("/about", "u4"),
        ("/pricing", "u5"),
    ];
    for (path, user) in visits {
        let (status, _) = pipeline.post(page_view("s1", path, user)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    pipeline.wait_persisted(visits.len()).await;

    let (_, first) = pipeline.stats("s1", "2024-01-01").await;
    let (_, second) = pipeline.stats("s1", "2024-01-01").await;

    assert_eq!(first, second);
    assert_eq!(first["total_views"], 8);
    assert_eq!(first["unique_users"], 5);
    assert_eq!(
        first["top_paths"],
        json!([
            { "path": "/home", "views": 3 },
            { "path": "/docs", "views": 2 },
            { "path": "/pricing", "views": 2 },
            { "path": "/about", "views": 1 }
        ])
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn test_events_outside_day_are_excluded() {
    let pipeline = Pipeline::start(0);

    for ts in ["2023-12-31T23:59:59Z", "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z"] {
        let body = json!({
            "site_id": "s1",
            "event_type": "page_view",
            "path": "/",
            "timestamp": ts
        });
        pipeline.post(body).await;
    }
    pipeline.wait_persisted(3).await;

    let (_, body) = pipeline.stats("s1", "2024-01-01").await;
    assert_eq!(body["total_views"], 1);
    assert_eq!(body["unique_users"], 0);

    pipeline.stop().await;
}
