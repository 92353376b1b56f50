// src/ingest/providers/mod.rs
pub mod feed;
pub mod news_api;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::dedup::canonical_url;
use crate::ingest::error::{check_status, IngestError};
use crate::ingest::limiter::PolitenessLimiter;
use crate::ingest::retry::RetryPolicy;
use crate::ingest::types::{Article, FetchReport, SourceDescriptor};
use crate::ingest::{detect_language, is_blacklisted, normalize_opt, normalize_text};

/// Global content filters applied to every accepted entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilters {
    /// Keywords that reject an entry when found in its title.
    pub blacklist: Vec<String>,
    /// ISO 639-1 codes; empty admits every language.
    pub allowed_languages: Vec<String>,
    pub min_words: usize,
}

impl ContentFilters {
    /// Reason for rejection, if any.
    pub fn rejects(&self, a: &Article) -> Option<&'static str> {
        if is_blacklisted(&a.title, &self.blacklist) {
            return Some("blacklisted keyword");
        }
        if !self.allowed_languages.is_empty()
            && !self
                .allowed_languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&a.language))
        {
            return Some("language not allowed");
        }
        if self.min_words > 0 && a.word_count() < self.min_words {
            return Some("too short");
        }
        None
    }
}

/// Everything a connector needs besides the descriptor itself.
#[derive(Clone)]
pub struct FetchContext {
    pub client: reqwest::Client,
    pub limiter: Arc<PolitenessLimiter>,
    pub retry: RetryPolicy,
    pub filters: Arc<ContentFilters>,
    /// Hard per-request timeout.
    pub timeout: Duration,
}

impl FetchContext {
    pub fn new(
        client: reqwest::Client,
        limiter: Arc<PolitenessLimiter>,
        retry: RetryPolicy,
        filters: ContentFilters,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            limiter,
            retry,
            filters: Arc::new(filters),
            timeout,
        }
    }
}

/// Connector-neutral view of one upstream entry, before validation.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl FetchReport {
    /// Validate, normalize and filter one entry, updating the counters.
    pub(crate) fn admit(
        &mut self,
        raw: RawEntry,
        source: &SourceDescriptor,
        filters: &ContentFilters,
        now: DateTime<Utc>,
    ) {
        self.fetched += 1;

        let title = normalize_opt(raw.title.as_deref());
        let url = raw.link.as_deref().and_then(canonical_url);
        let (Some(title), Some(url)) = (title, url) else {
            self.malformed += 1;
            tracing::debug!(target: "ingest", source = %source.id, link = ?raw.link, "skipping malformed entry");
            return;
        };

        let published = raw.published.unwrap_or(now);
        if now - published > source.freshness() {
            self.stale += 1;
            return;
        }

        let summary = normalize_opt(raw.summary.as_deref());
        let content = normalize_opt(raw.content.as_deref())
            .or_else(|| summary.clone())
            .unwrap_or_default();
        let lang_sample = format!("{title} {content}");

        let mut tags: Vec<String> = Vec::new();
        for t in raw.tags.iter().map(|t| normalize_text(t)) {
            if !t.is_empty() && !tags.contains(&t) {
                tags.push(t);
            }
        }

        let article = Article::new(source.id.clone(), title, url, published)
            .with_content(content)
            .with_summary(summary)
            .with_author(normalize_opt(raw.author.as_deref()))
            .with_image_url(raw.image_url.as_deref().and_then(canonical_url))
            .with_category(source.category.clone())
            .with_language(detect_language(&lang_sample))
            .with_tags(tags)
            .with_scraped_at(now);

        if let Some(reason) = filters.rejects(&article) {
            self.filtered += 1;
            tracing::debug!(target: "ingest", source = %source.id, url = %article.url, reason, "entry filtered");
            return;
        }
        self.articles.push(article);
    }
}

/// One paced, time-bounded GET. Non-2xx statuses become typed errors.
pub(crate) async fn get_text(
    ctx: &FetchContext,
    source: &SourceDescriptor,
    query: &[(String, String)],
    api_key: Option<&str>,
) -> Result<String, IngestError> {
    ctx.limiter.acquire(&source.id).await;

    let mut req = ctx.client.get(&source.endpoint).timeout(ctx.timeout);
    if !query.is_empty() {
        req = req.query(query);
    }
    if let Some(key) = api_key {
        req = req.header("X-Api-Key", key);
    }

    let call = async {
        let resp = req.send().await?;
        check_status(&resp)?;
        Ok::<_, IngestError>(resp.text().await?)
    };
    tokio::time::timeout(ctx.timeout, call)
        .await
        .map_err(|_| IngestError::Timeout)?
}

/// Feed and API timestamps: RFC 2822 first, then RFC 3339.
pub(crate) fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    use time::format_description::well_known::{Rfc2822, Rfc3339};
    use time::OffsetDateTime;

    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    let parsed = OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()
        .and_then(|dt| DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond()));
    // chrono is more lenient with obsolete zone names ("GMT", "EST")
    parsed.or_else(|| {
        DateTime::parse_from_rfc2822(ts)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}
