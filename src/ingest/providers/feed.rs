// src/ingest/providers/feed.rs
//! RSS 2.0 / RSS 1.0 / Atom connector: one GET per cycle, entries capped by `max_entries`.

use async_trait::async_trait;
use chrono::Utc;
use metrics::histogram;
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use crate::ingest::error::IngestError;
use crate::ingest::providers::{get_text, parse_timestamp, FetchContext, RawEntry};
use crate::ingest::retry;
use crate::ingest::types::{FetchReport, SourceConnector, SourceDescriptor};

#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<Text>,
    link: Option<Text>,
    description: Option<Text>,
    author: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<Text>,
    /// RSS 1.0 carries the date as Dublin Core.
    #[serde(rename = "dc:date", alias = "date")]
    dc_date: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<Text>,
    content: Option<Text>,
    published: Option<Text>,
    updated: Option<Text>,
    author: Option<AtomAuthor>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "@type")]
    mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term")]
    term: Option<String>,
}

fn text(t: Option<Text>) -> Option<String> {
    t.map(|t| t.value).filter(|v| !v.trim().is_empty())
}

impl From<RssItem> for RawEntry {
    fn from(it: RssItem) -> Self {
        let image_url = it.enclosure.and_then(|e| {
            let is_image = e
                .mime
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"));
            if is_image {
                e.url
            } else {
                None
            }
        });
        let description = text(it.description);
        RawEntry {
            title: text(it.title),
            link: text(it.link),
            content: description.clone(),
            summary: description,
            author: text(it.author),
            image_url,
            published: text(it.pub_date)
                .or_else(|| text(it.dc_date))
                .as_deref()
                .and_then(parse_timestamp),
            tags: it.categories.into_iter().filter_map(|c| text(Some(c))).collect(),
        }
    }
}

impl From<AtomEntry> for RawEntry {
    fn from(e: AtomEntry) -> Self {
        let rel_is = |l: &AtomLink, want: &str| l.rel.as_deref().unwrap_or("alternate") == want;
        let link = e
            .links
            .iter()
            .find(|l| rel_is(l, "alternate"))
            .or_else(|| e.links.first())
            .and_then(|l| l.href.clone());
        let image_url = e
            .links
            .iter()
            .find(|l| {
                rel_is(l, "enclosure")
                    && l.mime
                        .as_deref()
                        .is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"))
            })
            .and_then(|l| l.href.clone());
        let published = text(e.published)
            .or_else(|| text(e.updated))
            .as_deref()
            .and_then(parse_timestamp);

        RawEntry {
            title: text(e.title),
            link,
            content: text(e.content),
            summary: text(e.summary),
            author: e.author.and_then(|a| text(a.name)),
            image_url,
            published,
            tags: e.categories.into_iter().filter_map(|c| c.term).collect(),
        }
    }
}

/// Replace HTML-only entities that are not valid XML.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// RSS 2.0 and RSS 1.0 (RDF); `<item>` under `<channel>` or beside it.
    Rss,
    Atom,
}

fn entry(dialect: Dialect, fragment: &str) -> RawEntry {
    let parsed = match dialect {
        Dialect::Rss => from_str::<RssItem>(fragment).map(RawEntry::from),
        Dialect::Atom => from_str::<AtomEntry>(fragment).map(RawEntry::from),
    };
    // an unparseable entry surfaces as malformed (no title, no link)
    parsed.unwrap_or_else(|e| {
        tracing::debug!(target: "ingest", error = %e, "unparseable feed entry");
        RawEntry::default()
    })
}

/// Parse an RSS 2.0, RSS 1.0 (RDF) or Atom document into raw entries, in
/// document order. Entries are deserialized one at a time and reading stops
/// after `limit` of them.
pub(crate) fn parse_document(xml: &str, limit: usize) -> Result<Vec<RawEntry>, IngestError> {
    let xml = scrub_html_entities_for_xml(xml);
    let mut reader = Reader::from_str(&xml);
    let mut dialect = None;
    let mut out = Vec::new();

    loop {
        if dialect.is_some() && out.len() >= limit {
            break;
        }
        let start = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let Some(d) = dialect else {
                    dialect = Some(match local.as_ref() {
                        b"rss" | b"RDF" => Dialect::Rss,
                        b"feed" => Dialect::Atom,
                        other => {
                            return Err(IngestError::Malformed(format!(
                                "unrecognized feed root <{}>",
                                String::from_utf8_lossy(other)
                            )))
                        }
                    });
                    continue;
                };
                let is_entry = match d {
                    Dialect::Rss => local.as_ref() == b"item",
                    Dialect::Atom => local.as_ref() == b"entry",
                };
                if is_entry {
                    reader
                        .read_to_end(e.name())
                        .map_err(|e| IngestError::Malformed(format!("xml: {e}")))?;
                    let end = reader.buffer_position() as usize;
                    out.push(entry(d, &xml[start..end]));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Malformed(format!("xml: {e}"))),
            Ok(_) => {}
        }
    }

    if dialect.is_none() {
        return Err(IngestError::Malformed("empty feed document".into()));
    }
    Ok(out)
}

pub struct FeedConnector;

#[async_trait]
impl SourceConnector for FeedConnector {
    async fn fetch(
        &self,
        source: &SourceDescriptor,
        ctx: &FetchContext,
    ) -> Result<FetchReport, IngestError> {
        let t0 = std::time::Instant::now();
        let label = format!("feed:{}", source.id);
        let limit = source.max_entries;
        let entries = retry::execute(&ctx.retry, &label, move || async move {
            let body = get_text(ctx, source, &[], None).await?;
            parse_document(&body, limit)
        })
        .await?;

        let now = Utc::now();
        let mut report = FetchReport::default();
        for raw in entries {
            report.admit(raw, source, &ctx.filters, now);
        }

        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://news.example.com</link>
    <item>
      <title><![CDATA[Markets rally &nbsp;on jobs data]]></title>
      <link>https://news.example.com/a?utm_source=rss</link>
      <description>&lt;p&gt;Stocks rose.&lt;/p&gt;</description>
      <pubDate>Tue, 10 Jun 2025 14:30:00 +0000</pubDate>
      <category>Markets</category>
      <category domain="x">Economy</category>
      <enclosure url="https://img.example.com/a.jpg" type="image/jpeg" length="1"/>
    </item>
    <item>
      <title>Second</title>
      <link>https://news.example.com/b</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Atom</title>
  <entry>
    <title type="html">Atom entry</title>
    <link rel="alternate" href="https://atom.example.com/1"/>
    <link rel="enclosure" type="image/png" href="https://atom.example.com/1.png"/>
    <updated>2025-06-10T14:30:00Z</updated>
    <summary>Short</summary>
    <author><name>Jane Roe</name></author>
    <category term="science"/>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items_in_order() {
        let v = parse_document(RSS, 100).unwrap();
        assert_eq!(v.len(), 2);
        assert!(v[0].title.as_deref().unwrap().starts_with("Markets rally"));
        assert_eq!(
            v[0].image_url.as_deref(),
            Some("https://img.example.com/a.jpg")
        );
        assert_eq!(v[0].tags, vec!["Markets".to_string(), "Economy".to_string()]);
        assert!(v[0].published.is_some());
        assert_eq!(v[1].link.as_deref(), Some("https://news.example.com/b"));
        assert!(v[1].published.is_none());
    }

    #[test]
    fn parses_atom_entries() {
        let v = parse_document(ATOM, 100).unwrap();
        assert_eq!(v.len(), 1);
        let e = &v[0];
        assert_eq!(e.title.as_deref(), Some("Atom entry"));
        assert_eq!(e.link.as_deref(), Some("https://atom.example.com/1"));
        assert_eq!(e.image_url.as_deref(), Some("https://atom.example.com/1.png"));
        assert_eq!(e.author.as_deref(), Some("Jane Roe"));
        assert_eq!(e.tags, vec!["science".to_string()]);
        assert!(e.published.is_some());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_document("<html><body>nope", 100),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn empty_channel_is_ok() {
        let v = parse_document("<rss><channel><title>x</title></channel></rss>", 100).unwrap();
        assert!(v.is_empty());
    }

    const RDF: &str = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
         xmlns="http://purl.org/rss/1.0/"
         xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel rdf:about="https://rdf.example.com/">
    <title>RDF feed</title>
  </channel>
  <item rdf:about="https://rdf.example.com/1">
    <title>First RDF story</title>
    <link>https://rdf.example.com/1</link>
  </item>
  <item rdf:about="https://rdf.example.com/2">
    <title>Second RDF story</title>
    <link>https://rdf.example.com/2</link>
  </item>
</rdf:RDF>"#;

    #[test]
    fn parses_rdf_items_beside_channel() {
        let v = parse_document(RDF, 100).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].title.as_deref(), Some("First RDF story"));
        assert_eq!(v[1].link.as_deref(), Some("https://rdf.example.com/2"));
    }

    #[test]
    fn stops_reading_at_limit() {
        let v = parse_document(RSS, 1).unwrap();
        assert_eq!(v.len(), 1);
        assert!(v[0].title.as_deref().unwrap().starts_with("Markets rally"));

        // entries past the cap are never looked at, even when broken
        let second = RSS.rfind("<item>").unwrap();
        let truncated = format!("{}<item><title>bro", &RSS[..second]);
        assert_eq!(parse_document(&truncated, 1).unwrap().len(), 1);
        assert!(parse_document(&truncated, 2).is_err());

        assert!(parse_document(RSS, 0).unwrap().is_empty());
    }
}
