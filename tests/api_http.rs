// tests/api_http.rs
//
// HTTP-level tests for the trigger/inspection Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /scrape, POST /scrape/{source_id}
// - GET /jobs, GET /jobs/{id}, POST /jobs/{id}/cancel
// - GET /sources (api keys redacted)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use news_ingestor::api::{create_router, AppState};
use news_ingestor::ingest::dedup::{DedupCache, DedupSettings};
use news_ingestor::ingest::delivery::{ArticlePayload, ArticleSink, DeliveryPipeline};
use news_ingestor::ingest::error::IngestError;
use news_ingestor::ingest::job::{JobClass, JobRegistry};
use news_ingestor::ingest::limiter::PolitenessLimiter;
use news_ingestor::ingest::pipeline::Ingestor;
use news_ingestor::ingest::providers::{ContentFilters, FetchContext};
use news_ingestor::ingest::retry::RetryPolicy;
use news_ingestor::ingest::scheduler::{LaneConfig, OverlapPolicy, Scheduler};
use news_ingestor::ingest::types::{
    Article, ConnectorRegistry, FetchReport, SourceConnector, SourceDescriptor, SourceKind,
};

const BODY_LIMIT: usize = 1024 * 1024;

struct OneArticle;

#[async_trait]
impl SourceConnector for OneArticle {
    async fn fetch(
        &self,
        source: &SourceDescriptor,
        _ctx: &FetchContext,
    ) -> Result<FetchReport, IngestError> {
        let a = Article::new(
            source.id.clone(),
            "Only story",
            format!("https://{}.example.com/only", source.id),
            Utc::now(),
        );
        Ok(FetchReport {
            fetched: 1,
            articles: vec![a],
            ..FetchReport::default()
        })
    }

    fn name(&self) -> &'static str {
        "one"
    }
}

struct NullSink;

#[async_trait]
impl ArticleSink for NullSink {
    async fn send_batch(&self, batch: &[ArticlePayload]) -> Result<usize, IngestError> {
        Ok(batch.len())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Build the same Router the binary uses, over an in-process pipeline.
fn test_router(lanes: &[LaneConfig]) -> (Router, Arc<Scheduler>) {
    let mut connectors = ConnectorRegistry::empty();
    connectors.register(SourceKind::Api, Arc::new(OneArticle));

    let mut wire = SourceDescriptor::new("wire", SourceKind::Api, "http://unused");
    wire.api_key = Some("super-secret".into());

    let retry = RetryPolicy::new(1, Duration::from_millis(1));
    let fetch = FetchContext::new(
        reqwest::Client::new(),
        Arc::new(PolitenessLimiter::new()),
        retry,
        ContentFilters::default(),
        Duration::from_secs(1),
    );
    let ingestor = Ingestor::new(
        vec![wire],
        fetch,
        Arc::new(DedupCache::new(DedupSettings::default())),
        DeliveryPipeline::new(Arc::new(NullSink), retry, 10),
    )
    .with_connectors(connectors);

    let scheduler = Scheduler::start(
        Arc::new(ingestor),
        Arc::new(JobRegistry::with_capacity(20)),
        lanes,
    );
    (create_router(AppState::new(scheduler.clone())), scheduler)
}

fn default_lanes() -> Vec<LaneConfig> {
    [JobClass::Scrape, JobClass::Cleanup]
        .into_iter()
        .map(|class| LaneConfig {
            class,
            workers: 1,
            capacity: 4,
            overlap: OverlapPolicy::Skip,
        })
        .collect()
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        Json::String(String::from_utf8_lossy(&bytes).into_owned())
    });
    (status, json)
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _) = test_router(&default_lanes());
    let (status, body) = call(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Json::String("ok".into()));
}

#[tokio::test]
async fn scrape_unknown_source_is_404() {
    let (app, _) = test_router(&default_lanes());
    let (status, body) = call(&app, "POST", "/scrape/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn scrape_source_returns_job_that_can_be_inspected() {
    let (app, scheduler) = test_router(&default_lanes());

    let (status, body) = call(&app, "POST", "/scrape/wire").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let id = body["job_id"].as_u64().expect("numeric job id");

    for _ in 0..200 {
        if scheduler
            .registry()
            .get(id)
            .is_some_and(|j| j.status.is_terminal())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, job) = call(&app, "GET", &format!("/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["target"]["scope"], "source");
    assert_eq!(job["stats"]["delivered"], 1);

    let (status, list) = call(&app, "GET", "/jobs?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap()[0]["id"].as_u64(), Some(id));

    let (status, _) = call(&app, "POST", &format!("/jobs/{id}/cancel")).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "finished jobs cannot be cancelled");
}

#[tokio::test]
async fn unknown_job_is_404() {
    let (app, _) = test_router(&default_lanes());
    let (status, _) = call(&app, "GET", "/jobs/4242").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scrape_without_lane_is_503() {
    let lanes = vec![LaneConfig {
        class: JobClass::Cleanup,
        workers: 1,
        capacity: 1,
        overlap: OverlapPolicy::Skip,
    }];
    let (app, _) = test_router(&lanes);
    let (status, body) = call(&app, "POST", "/scrape").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "failed");
    assert!(body["failure"].as_str().unwrap().contains("no worker available"));
}

#[tokio::test]
async fn sources_are_listed_with_redacted_keys() {
    let (app, _) = test_router(&default_lanes());
    let (status, body) = call(&app, "GET", "/sources").await;
    assert_eq!(status, StatusCode::OK);
    let sources = body.as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["id"], "wire");
    assert_eq!(sources[0]["kind"], "api");
    assert_eq!(sources[0]["api_key"], "***");
}
