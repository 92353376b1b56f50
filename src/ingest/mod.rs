// src/ingest/mod.rs
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod enrich;
pub mod error;
pub mod job;
pub mod limiter;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_fetched_total",
            "Entries seen by connectors (accepted or not)."
        );
        describe_counter!(
            "ingest_stale_total",
            "Entries discarded as older than the source freshness window."
        );
        describe_counter!(
            "ingest_malformed_total",
            "Entries skipped for missing title/link or invalid URL."
        );
        describe_counter!(
            "ingest_filtered_total",
            "Entries dropped by content filters (blacklist/language/length)."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Articles removed by exact fingerprint deduplication."
        );
        describe_counter!(
            "ingest_near_dup_total",
            "Articles removed by the embedding near-duplicate tier."
        );
        describe_counter!(
            "ingest_delivered_total",
            "Articles acknowledged by the storage backend."
        );
        describe_counter!(
            "ingest_failed_batches_total",
            "Delivery batches that exhausted their retries."
        );
        describe_counter!(
            "ingest_retries_total",
            "Retries issued by the backoff executor."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Source fetches that failed terminally."
        );
        describe_counter!("ingest_jobs_total", "Finished ingestion jobs by status.");
        describe_counter!(
            "ingest_jobs_skipped_total",
            "Periodic triggers skipped because the previous job was still active."
        );
        describe_histogram!("ingest_fetch_ms", "Source fetch time in milliseconds.");
        describe_gauge!(
            "ingest_last_job_ts",
            "Unix ts when an ingestion job last finished."
        );
    });
}

/// Normalize text: decode entities, strip markup, unify quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out.trim().to_string()
}

/// Like `normalize_text`, but empty results become `None`.
pub fn normalize_opt(s: Option<&str>) -> Option<String> {
    s.map(normalize_text).filter(|t| !t.is_empty())
}

/// Case-insensitive keyword hit anywhere in `text`.
pub fn is_blacklisted<S: AsRef<str>>(text: S, blacklist: &[String]) -> bool {
    let t = text.as_ref().to_lowercase();
    blacklist
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .any(|w| t.contains(&w.to_lowercase()))
}

const STOPWORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &[
            "the", "and", "of", "to", "in", "is", "that", "for", "with", "was", "on", "are",
        ],
    ),
    (
        "de",
        &[
            "der", "die", "und", "das", "ist", "nicht", "mit", "den", "von", "auf", "ein", "sich",
        ],
    ),
    (
        "fr",
        &[
            "le", "la", "les", "et", "des", "est", "une", "dans", "pour", "que", "pas", "du",
        ],
    ),
    (
        "es",
        &[
            "el", "los", "las", "y", "del", "que", "una", "por", "con", "para", "es", "se",
        ],
    ),
];

/// Cheap language guess: Cyrillic share, then stopword hits.
/// Returns an ISO 639-1 code or `"unknown"`.
pub fn detect_language(text: &str) -> String {
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    if letters == 0 {
        return "unknown".to_string();
    }
    let cyrillic = text
        .chars()
        .filter(|c| ('\u{0400}'..='\u{04FF}').contains(c))
        .count();
    if cyrillic * 2 > letters {
        return "ru".to_string();
    }

    let words: Vec<String> = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let mut best: Option<(&str, usize)> = None;
    for (lang, stops) in STOPWORDS {
        let hits = words.iter().filter(|w| stops.contains(&w.as_str())).count();
        if hits > best.map_or(0, |(_, h)| h) {
            best = Some((lang, hits));
        }
    }
    match best {
        Some((lang, hits)) if hits >= 2 => lang.to_string(),
        _ => "unknown".to_string(),
    }
}
