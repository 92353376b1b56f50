// src/ingest/enrich.rs
//! ML enrichment collaborator: provider abstraction + HTTP client + no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ingest::error::{check_status, IngestError};
use crate::ingest::types::Article;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Fields returned by the enrichment service. All optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub sentiment_score: Option<f32>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Used only for near-duplicate detection; never forwarded to the backend.
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    /// `Ok(None)` means enrichment is switched off.
    async fn enrich(&self, article: &Article) -> Result<Option<Enrichment>, IngestError>;
    fn name(&self) -> &'static str;
}

pub type DynEnricher = Arc<dyn Enricher>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8001".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Factory: disabled config yields a no-op enricher.
pub fn build_enricher(cfg: &EnrichmentConfig, client: reqwest::Client) -> DynEnricher {
    if !cfg.enabled || cfg.url.trim().is_empty() {
        return Arc::new(DisabledEnricher);
    }
    Arc::new(HttpEnricher::new(
        client,
        &cfg.url,
        Duration::from_secs(cfg.timeout_secs.max(1)),
    ))
}

pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    async fn enrich(&self, _article: &Article) -> Result<Option<Enrichment>, IngestError> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Posts `{title, text}` to `{base}/api/predict-complete`.
pub struct HttpEnricher {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct PredictReq<'a> {
    title: &'a str,
    text: &'a str,
}

impl HttpEnricher {
    pub fn new(http: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: format!("{}/api/predict-complete", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, article: &Article) -> Result<Option<Enrichment>, IngestError> {
        let text = if article.content.is_empty() {
            article.summary.as_deref().unwrap_or(&article.title)
        } else {
            article.content.as_str()
        };
        let req = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&PredictReq {
                title: &article.title,
                text,
            });

        let call = async {
            let resp = req.send().await?;
            check_status(&resp)?;
            let out: Enrichment = resp.json().await?;
            Ok::<_, IngestError>(out)
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(r) => r.map(Some),
            Err(_) => Err(IngestError::Timeout),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
