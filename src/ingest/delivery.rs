// src/ingest/delivery.rs
//! Batched, retried, at-least-once delivery to the storage backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ingest::enrich::Entity;
use crate::ingest::error::{check_status, IngestError};
use crate::ingest::job::JobStats;
use crate::ingest::retry::{self, RetryPolicy};
use crate::ingest::types::Article;

/// Wire shape of one article in a backend batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticlePayload {
    pub title: String,
    pub url: String,
    pub content: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source: String,
    pub category: Option<String>,
    pub language: String,
    pub tags: Vec<String>,
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
}

impl From<&Article> for ArticlePayload {
    fn from(a: &Article) -> Self {
        let e = a.enrichment.as_ref();
        Self {
            title: a.title.clone(),
            url: a.url.clone(),
            content: a.content.clone(),
            summary: a
                .summary
                .clone()
                .or_else(|| e.and_then(|e| e.summary.clone())),
            author: a.author.clone(),
            image_url: a.image_url.clone(),
            published_at: a.published_at,
            source: a.source_id.clone(),
            category: a.category.clone(),
            language: a.language.clone(),
            tags: a.tags.clone(),
            content_hash: a.fingerprint.clone(),
            scraped_at: a.scraped_at,
            sentiment: e.and_then(|e| e.sentiment.clone()),
            sentiment_score: e.and_then(|e| e.sentiment_score),
            entities: e.map(|e| e.entities.clone()).unwrap_or_default(),
        }
    }
}

#[async_trait]
pub trait ArticleSink: Send + Sync {
    /// Send one batch; returns how many articles the backend accepted.
    async fn send_batch(&self, batch: &[ArticlePayload]) -> Result<usize, IngestError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// `POST {base}/api/v1/news/batch` with `{"articles": [...]}`.
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct BatchReq<'a> {
    articles: &'a [ArticlePayload],
}

#[derive(Deserialize)]
struct BatchResp {
    #[serde(default)]
    created: Option<usize>,
}

impl HttpBackend {
    pub fn new(http: reqwest::Client, cfg: &BackendConfig) -> Self {
        Self {
            http,
            endpoint: format!("{}/api/v1/news/batch", cfg.url.trim_end_matches('/')),
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ArticleSink for HttpBackend {
    async fn send_batch(&self, batch: &[ArticlePayload]) -> Result<usize, IngestError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&BatchReq { articles: batch });
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }

        let call = async {
            let resp = req.send().await?;
            check_status(&resp)?;
            // an empty or unexpected body still means the batch landed
            let body = resp.text().await?;
            let created = serde_json::from_str::<BatchResp>(&body)
                .ok()
                .and_then(|r| r.created);
            Ok::<_, IngestError>(created.unwrap_or(batch.len()))
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| IngestError::Timeout)?
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// An ordered slice of the job's articles with its position in the send order.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryBatch<'a> {
    pub seq: usize,
    pub articles: &'a [Article],
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub seq: usize,
    pub size: usize,
    pub sent: usize,
    pub attempts: u32,
    pub error: Option<String>,
}

pub struct DeliveryPipeline {
    sink: Arc<dyn ArticleSink>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl DeliveryPipeline {
    pub fn new(sink: Arc<dyn ArticleSink>, retry: RetryPolicy, batch_size: usize) -> Self {
        Self {
            sink,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn partition<'a>(&self, articles: &'a [Article]) -> Vec<DeliveryBatch<'a>> {
        articles
            .chunks(self.batch_size)
            .enumerate()
            .map(|(seq, articles)| DeliveryBatch { seq, articles })
            .collect()
    }

    /// Send one batch through the retry executor. Never propagates the error.
    pub async fn send(&self, batch: DeliveryBatch<'_>) -> BatchOutcome {
        let payload: Vec<ArticlePayload> = batch.articles.iter().map(ArticlePayload::from).collect();
        let label = format!("deliver:batch{}", batch.seq);
        let sink = &self.sink;
        let payload = &payload;
        let out = retry::execute_counted(&self.retry, &label, move || async move {
            sink.send_batch(payload).await
        })
        .await;

        match out.result {
            Ok(sent) => BatchOutcome {
                seq: batch.seq,
                size: batch.articles.len(),
                sent,
                attempts: out.attempts,
                error: None,
            },
            Err(e) => BatchOutcome {
                seq: batch.seq,
                size: batch.articles.len(),
                sent: 0,
                attempts: out.attempts,
                error: Some(e.to_string()),
            },
        }
    }

    /// Partition and send in order; a failed batch does not stop later ones.
    /// Outcomes are folded into `stats`.
    pub async fn deliver(
        &self,
        source_id: &str,
        articles: &[Article],
        stats: &mut JobStats,
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();
        let mut offered = 0usize;
        for batch in self.partition(articles) {
            if cancel.is_cancelled() {
                let left = articles.len() - offered;
                tracing::info!(target: "delivery", source = source_id, batch = batch.seq, abandoned = left, "cancelled before batch");
                stats.interrupt(left);
                break;
            }
            offered += batch.articles.len();
            let outcome = self.send(batch).await;
            match &outcome.error {
                None => tracing::debug!(
                    target: "delivery",
                    source = source_id,
                    batch = outcome.seq,
                    sent = outcome.sent,
                    attempts = outcome.attempts,
                    "batch delivered"
                ),
                Some(err) => tracing::warn!(
                    target: "delivery",
                    source = source_id,
                    batch = outcome.seq,
                    size = outcome.size,
                    attempts = outcome.attempts,
                    error = %err,
                    "batch failed after retries"
                ),
            }
            stats.fold_batch(&outcome);
            outcomes.push(outcome);
        }

        let sent: usize = outcomes.iter().map(|o| o.sent).sum();
        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        counter!("ingest_delivered_total").increment(sent as u64);
        counter!("ingest_failed_batches_total").increment(failed as u64);
        outcomes
    }
}
