// src/ingest/types.rs
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::dedup::fingerprint;
use crate::ingest::enrich::Enrichment;
use crate::ingest::error::IngestError;
use crate::ingest::providers::FetchContext;

/// A normalized article as produced by a connector.
///
/// `fingerprint` is derived from the normalized title and canonical URL at
/// construction and never recomputed; only `enrichment` (and a missing
/// `category`) is filled in later, before delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    pub title: String,
    pub url: String,
    pub content: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_id: String,
    pub category: Option<String>,
    pub language: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub fingerprint: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

impl Article {
    /// `url` must already be canonical (see `dedup::canonical_url`).
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let url = url.into();
        let fingerprint = fingerprint(&title, &url);
        Self {
            title,
            url,
            content: String::new(),
            summary: None,
            author: None,
            image_url: None,
            published_at,
            source_id: source_id.into(),
            category: None,
            language: "unknown".to_string(),
            tags: Vec::new(),
            fingerprint,
            scraped_at: Utc::now(),
            enrichment: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author;
        self
    }

    pub fn with_image_url(mut self, image_url: Option<String>) -> Self {
        self.image_url = image_url;
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_scraped_at(mut self, scraped_at: DateTime<Utc>) -> Self {
        self.scraped_at = scraped_at;
        self
    }

    /// Word count of the body, falling back to the summary.
    pub fn word_count(&self) -> usize {
        let body = if self.content.is_empty() {
            self.summary.as_deref().unwrap_or_default()
        } else {
            self.content.as_str()
        };
        body.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Feed,
    Api,
    Web,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Feed => "feed",
            SourceKind::Api => "api",
            SourceKind::Web => "web",
        })
    }
}

/// Per-source request pacing. The effective interval is the stricter of the two.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Politeness {
    pub max_requests_per_sec: f64,
    pub min_delay_ms: u64,
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            max_requests_per_sec: 2.0,
            min_delay_ms: 1_000,
        }
    }
}

/// Longest pause the limiter will ever impose between two requests.
pub const MAX_REQUEST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(86_400);

impl Politeness {
    /// Effective pause between requests, saturating at `MAX_REQUEST_INTERVAL`.
    pub fn interval(&self) -> std::time::Duration {
        let by_rate = if self.max_requests_per_sec > 0.0 && self.max_requests_per_sec.is_finite()
        {
            std::time::Duration::try_from_secs_f64(1.0 / self.max_requests_per_sec)
                .unwrap_or(MAX_REQUEST_INTERVAL)
        } else {
            std::time::Duration::ZERO
        };
        by_rate
            .max(std::time::Duration::from_millis(self.min_delay_ms))
            .min(MAX_REQUEST_INTERVAL)
    }
}

fn default_scrape_interval_secs() -> u64 {
    30 * 60
}
fn default_freshness_hours() -> u64 {
    24
}
fn default_true() -> bool {
    true
}
fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    5
}
fn default_max_entries() -> usize {
    200
}

/// Static description of one external source. Immutable after config load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_scrape_interval_secs")]
    pub scrape_interval_secs: u64,
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,
    #[serde(default)]
    pub politeness: Politeness,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Extra query parameters passed through to API sources (`q`, `language`, ...).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, kind: SourceKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            endpoint: endpoint.into(),
            category: None,
            scrape_interval_secs: default_scrape_interval_secs(),
            freshness_hours: default_freshness_hours(),
            politeness: Politeness::default(),
            enabled: true,
            api_key: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_entries: default_max_entries(),
            params: BTreeMap::new(),
        }
    }

    pub fn freshness(&self) -> chrono::Duration {
        // clamp to ~100 years so the conversion cannot overflow
        chrono::Duration::hours(self.freshness_hours.min(876_000) as i64)
    }

    /// Copy safe to expose over HTTP.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if out.api_key.is_some() {
            out.api_key = Some("***".to_string());
        }
        out
    }
}

/// What one connector invocation produced. Counters cover every entry seen,
/// `articles` only the accepted ones, in source order.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub articles: Vec<Article>,
    pub fetched: usize,
    pub stale: usize,
    pub malformed: usize,
    pub filtered: usize,
    /// Non-fatal errors (e.g. a later API page failing).
    pub errors: Vec<String>,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Fetch from scratch; transport failures are retried inside.
    async fn fetch(
        &self,
        source: &SourceDescriptor,
        ctx: &FetchContext,
    ) -> Result<FetchReport, IngestError>;

    fn name(&self) -> &'static str;
}

/// Dispatch table from source kind to connector.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<SourceKind, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Feed and polling-API connectors. `web` stays unregistered.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.register(
            SourceKind::Feed,
            Arc::new(crate::ingest::providers::feed::FeedConnector),
        );
        r.register(
            SourceKind::Api,
            Arc::new(crate::ingest::providers::news_api::NewsApiConnector),
        );
        r
    }

    pub fn register(&mut self, kind: SourceKind, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(kind, connector);
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn SourceConnector>, IngestError> {
        self.connectors
            .get(&kind)
            .cloned()
            .ok_or(IngestError::UnsupportedKind(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn politeness_takes_the_stricter_limit() {
        let p = Politeness {
            max_requests_per_sec: 2.0,
            min_delay_ms: 0,
        };
        assert_eq!(p.interval(), std::time::Duration::from_millis(500));

        let p = Politeness {
            max_requests_per_sec: 10.0,
            min_delay_ms: 1_000,
        };
        assert_eq!(p.interval(), std::time::Duration::from_secs(1));

        let p = Politeness {
            max_requests_per_sec: 0.0,
            min_delay_ms: 0,
        };
        assert_eq!(p.interval(), std::time::Duration::ZERO);
    }

    #[test]
    fn extreme_politeness_saturates_instead_of_panicking() {
        let p = Politeness {
            max_requests_per_sec: 1e-30,
            min_delay_ms: 0,
        };
        assert_eq!(p.interval(), MAX_REQUEST_INTERVAL);

        let p = Politeness {
            max_requests_per_sec: f64::MIN_POSITIVE,
            min_delay_ms: u64::MAX,
        };
        assert_eq!(p.interval(), MAX_REQUEST_INTERVAL);
    }

    #[test]
    fn descriptor_defaults_from_toml() {
        let d: SourceDescriptor = toml::from_str(
            r#"
id = "bbc"
kind = "feed"
endpoint = "https://feeds.bbci.co.uk/news/rss.xml"
"#,
        )
        .unwrap();
        assert_eq!(d.kind, SourceKind::Feed);
        assert!(d.enabled);
        assert_eq!(d.freshness_hours, 24);
        assert_eq!(d.politeness, Politeness::default());
        assert_eq!(d, SourceDescriptor::new("bbc", SourceKind::Feed, d.endpoint.clone()));
    }

    #[test]
    fn redaction_hides_api_key() {
        let mut d = SourceDescriptor::new("newsapi", SourceKind::Api, "http://x");
        d.api_key = Some("secret".into());
        assert_eq!(d.redacted().api_key.as_deref(), Some("***"));
        assert_eq!(d.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn web_kind_has_no_connector() {
        let r = ConnectorRegistry::with_defaults();
        assert!(r.get(SourceKind::Feed).is_ok());
        assert!(r.get(SourceKind::Api).is_ok());
        assert!(matches!(
            r.get(SourceKind::Web),
            Err(IngestError::UnsupportedKind(SourceKind::Web))
        ));
    }

    #[test]
    fn word_count_falls_back_to_summary() {
        let a = Article::new("s", "t", "https://a.example/x", Utc::now())
            .with_summary(Some("one two three".into()));
        assert_eq!(a.word_count(), 3);
        let a = a.with_content("just two");
        assert_eq!(a.word_count(), 2);
    }
}
