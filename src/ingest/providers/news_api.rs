// src/ingest/providers/news_api.rs
//! Polling REST connector for NewsAPI-style `everything` endpoints.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use metrics::histogram;
use serde::Deserialize;

use crate::ingest::error::IngestError;
use crate::ingest::providers::{get_text, parse_timestamp, FetchContext, RawEntry};
use crate::ingest::retry;
use crate::ingest::types::{FetchReport, SourceConnector, SourceDescriptor};

/// Upstream hard limit on `pageSize`.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Body shorter than this is replaced by the description (NewsAPI truncates `content`).
const MIN_CONTENT_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiPage {
    status: String,
    #[serde(rename = "totalResults", default)]
    total_results: Option<u64>,
    #[serde(default)]
    articles: Vec<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiArticle {
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "urlToImage", default)]
    url_to_image: Option<String>,
    #[serde(rename = "publishedAt", default)]
    published_at: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    source: Option<ApiSource>,
}

#[derive(Debug, Deserialize)]
struct ApiSource {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl From<ApiArticle> for RawEntry {
    fn from(a: ApiArticle) -> Self {
        let content = match (a.content, a.description.clone()) {
            (Some(c), desc) if c.chars().count() < MIN_CONTENT_CHARS => desc.or(Some(c)),
            (Some(c), _) => Some(c),
            (None, desc) => desc,
        };
        let outlet = a.source.and_then(|s| s.id.or(s.name));
        RawEntry {
            title: a.title,
            link: a.url,
            content,
            summary: a.description,
            author: a.author,
            image_url: a.url_to_image,
            published: a.published_at.as_deref().and_then(parse_timestamp),
            tags: outlet.into_iter().collect(),
        }
    }
}

/// Parse one page: top-level shape is strict, individual articles are not.
fn parse_page(body: &str) -> Result<(Vec<Option<RawEntry>>, Option<u64>), IngestError> {
    let page: ApiPage =
        serde_json::from_str(body).map_err(|e| IngestError::Malformed(format!("api page: {e}")))?;
    if page.status != "ok" {
        return Err(IngestError::Malformed(format!(
            "api status `{}`: {}",
            page.status,
            page.message.unwrap_or_default()
        )));
    }
    let entries = page
        .articles
        .into_iter()
        .map(|v| serde_json::from_value::<ApiArticle>(v).ok().map(RawEntry::from))
        .collect();
    Ok((entries, page.total_results))
}

fn page_query(source: &SourceDescriptor, page: u32, page_size: u32) -> Vec<(String, String)> {
    let now = Utc::now();
    let from = now - source.freshness();
    let mut q: Vec<(String, String)> = source
        .params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    q.push(("from".into(), from.to_rfc3339_opts(SecondsFormat::Secs, true)));
    q.push(("to".into(), now.to_rfc3339_opts(SecondsFormat::Secs, true)));
    q.push(("sortBy".into(), "publishedAt".into()));
    q.push(("page".into(), page.to_string()));
    q.push(("pageSize".into(), page_size.to_string()));
    q
}

pub struct NewsApiConnector;

#[async_trait]
impl SourceConnector for NewsApiConnector {
    async fn fetch(
        &self,
        source: &SourceDescriptor,
        ctx: &FetchContext,
    ) -> Result<FetchReport, IngestError> {
        let t0 = std::time::Instant::now();
        let page_size = source.page_size.clamp(1, MAX_PAGE_SIZE);
        let max_pages = source.max_pages.max(1);
        let api_key = source.api_key.as_deref();

        let mut report = FetchReport::default();
        let mut seen = 0u64;

        for page in 1..=max_pages {
            let label = format!("api:{}:p{page}", source.id);
            let query = page_query(source, page, page_size);
            let query = &query;
            let fetched = retry::execute(&ctx.retry, &label, move || async move {
                let body = get_text(ctx, source, query, api_key).await?;
                parse_page(&body)
            })
            .await;

            let (entries, total) = match fetched {
                Ok(v) => v,
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    tracing::warn!(target: "ingest", source = %source.id, page, error = %e, "later page failed; keeping earlier pages");
                    report.errors.push(format!("page {page}: {e}"));
                    break;
                }
            };

            let n = entries.len() as u64;
            seen += n;
            let now = Utc::now();
            for entry in entries {
                match entry {
                    Some(raw) => report.admit(raw, source, &ctx.filters, now),
                    None => {
                        report.fetched += 1;
                        report.malformed += 1;
                    }
                }
            }

            let exhausted = n < u64::from(page_size) || total.is_some_and(|t| seen >= t);
            if exhausted {
                break;
            }
        }

        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "news_api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_parsing_skips_bad_articles() {
        let body = r#"{
          "status": "ok",
          "totalResults": 3,
          "articles": [
            {"source": {"id": null, "name": "Wire"}, "title": "One", "url": "https://a.example/1",
             "publishedAt": "2025-06-10T14:30:00Z", "description": "desc", "content": "short"},
            {"title": 42},
            {"title": "Three", "url": "https://a.example/3"}
          ]
        }"#;
        let (entries, total) = parse_page(body).unwrap();
        assert_eq!(total, Some(3));
        assert_eq!(entries.len(), 3);
        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.content.as_deref(), Some("desc"));
        assert_eq!(first.tags, vec!["Wire".to_string()]);
        assert!(first.published.is_some());
        assert!(entries[1].is_none());
        assert!(entries[2].is_some());
    }

    #[test]
    fn error_status_is_malformed() {
        let body = r#"{"status":"error","code":"apiKeyInvalid","message":"bad key"}"#;
        assert!(matches!(parse_page(body), Err(IngestError::Malformed(_))));
        assert!(matches!(parse_page("<html>"), Err(IngestError::Malformed(_))));
    }

    #[test]
    fn query_carries_window_and_paging() {
        let mut s = SourceDescriptor::new(
            "newsapi",
            crate::ingest::types::SourceKind::Api,
            "http://x",
        );
        s.params.insert("q".into(), "economy".into());
        let q = page_query(&s, 2, 50);
        let get = |k: &str| q.iter().find(|(kk, _)| kk == k).map(|(_, v)| v.as_str());
        assert_eq!(get("q"), Some("economy"));
        assert_eq!(get("page"), Some("2"));
        assert_eq!(get("pageSize"), Some("50"));
        assert!(get("from").unwrap().ends_with('Z'));
        assert!(get("to").is_some());
    }
}
