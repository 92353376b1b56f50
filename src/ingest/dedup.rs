// src/ingest/dedup.rs
//! Content-fingerprint deduplication shared by every fetch path.
//!
//! Exact tier: SHA-256 over the normalized title and canonical URL, kept for a
//! retention window. Optional near-duplicate tier: cosine similarity of
//! embeddings against a bounded window of recently accepted articles.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::ingest::normalize_text;
use crate::ingest::types::Article;

/// Lowercased, whitespace-collapsed title without trailing sentence punctuation.
pub fn normalize_title(title: &str) -> String {
    let mut out = normalize_text(title).to_lowercase();
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',' | ':' | ';') {
            out.pop();
        } else {
            break;
        }
    }
    out.trim_end().to_string()
}

/// Canonical form of an article link: absolute http(s), no fragment, no
/// `utm_*` tracking parameters, lowercase host (done by `url`).
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Some(url.to_string())
}

/// Deterministic fingerprint of (normalized title, canonical URL), hex encoded.
pub fn fingerprint(title: &str, canonical_url: &str) -> String {
    let mut h = Sha256::new();
    h.update(normalize_title(title).as_bytes());
    h.update([0u8]);
    h.update(canonical_url.as_bytes());
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub source_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Fresh,
    Duplicate(FingerprintRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearMatch {
    pub original_url: String,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub retention: chrono::Duration,
    /// `None` disables the near-duplicate tier.
    pub near_threshold: Option<f32>,
    pub near_window: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::hours(48),
            near_threshold: None,
            near_window: 500,
        }
    }
}

#[derive(Debug)]
struct RecentEmbedding {
    url: String,
    seen: DateTime<Utc>,
    vector: Vec<f32>,
}

#[derive(Debug)]
pub struct DedupCache {
    settings: DedupSettings,
    records: Mutex<HashMap<String, FingerprintRecord>>,
    recent: Mutex<VecDeque<RecentEmbedding>>,
}

impl DedupCache {
    pub fn new(settings: DedupSettings) -> Self {
        let cap = settings.near_window.min(10_000);
        Self {
            settings,
            records: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn settings(&self) -> &DedupSettings {
        &self.settings
    }

    fn is_live(&self, rec: &FingerprintRecord, now: DateTime<Utc>) -> bool {
        now - rec.first_seen < self.settings.retention
    }

    pub fn is_duplicate(&self, article: &Article) -> bool {
        self.is_duplicate_at(article, Utc::now())
    }

    /// Pure read: expired entries do not count.
    pub fn is_duplicate_at(&self, article: &Article, now: DateTime<Utc>) -> bool {
        let map = self.records.lock().expect("dedup mutex poisoned");
        map.get(&article.fingerprint)
            .is_some_and(|r| self.is_live(r, now))
    }

    pub fn record(&self, article: &Article) {
        self.record_at(article, Utc::now());
    }

    /// Idempotent: a live record keeps its first-seen time, an expired one is replaced.
    pub fn record_at(&self, article: &Article, now: DateTime<Utc>) {
        let mut map = self.records.lock().expect("dedup mutex poisoned");
        self.upsert_locked(&mut map, article, now);
    }

    pub fn check_and_record(&self, article: &Article) -> DedupVerdict {
        self.check_and_record_at(article, Utc::now())
    }

    /// Check and insert under one lock, so concurrent sources racing on the
    /// same fingerprint let exactly one through.
    pub fn check_and_record_at(&self, article: &Article, now: DateTime<Utc>) -> DedupVerdict {
        let mut map = self.records.lock().expect("dedup mutex poisoned");
        if let Some(rec) = map.get(&article.fingerprint) {
            if self.is_live(rec, now) {
                return DedupVerdict::Duplicate(rec.clone());
            }
        }
        self.upsert_locked(&mut map, article, now);
        DedupVerdict::Fresh
    }

    fn upsert_locked(
        &self,
        map: &mut HashMap<String, FingerprintRecord>,
        article: &Article,
        now: DateTime<Utc>,
    ) {
        let live = map
            .get(&article.fingerprint)
            .is_some_and(|r| self.is_live(r, now));
        if !live {
            map.insert(
                article.fingerprint.clone(),
                FingerprintRecord {
                    fingerprint: article.fingerprint.clone(),
                    first_seen: now,
                    source_id: article.source_id.clone(),
                    url: article.url.clone(),
                },
            );
        }
    }

    pub fn near_duplicate_of(&self, article: &Article, embedding: &[f32]) -> Option<NearMatch> {
        self.near_duplicate_at(article, embedding, Utc::now())
    }

    /// Compare against the recent window; on a miss the embedding joins the
    /// window. Always `None` when the tier is disabled.
    pub fn near_duplicate_at(
        &self,
        article: &Article,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Option<NearMatch> {
        let threshold = self.settings.near_threshold?;
        if embedding.is_empty() || self.settings.near_window == 0 {
            return None;
        }
        let mut recent = self.recent.lock().expect("dedup mutex poisoned");
        let retention = self.settings.retention;
        recent.retain(|r| now - r.seen < retention);

        let best = recent
            .iter()
            .filter(|r| r.url != article.url)
            .map(|r| (r, cosine_similarity(&r.vector, embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((r, sim)) = best {
            if sim >= threshold {
                return Some(NearMatch {
                    original_url: r.url.clone(),
                    similarity: sim,
                });
            }
        }

        recent.push_back(RecentEmbedding {
            url: article.url.clone(),
            seen: now,
            vector: embedding.to_vec(),
        });
        while recent.len() > self.settings.near_window {
            recent.pop_front();
        }
        None
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop expired fingerprint records; returns how many were removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.records.lock().expect("dedup mutex poisoned");
        let before = map.len();
        map.retain(|_, r| self.is_live(r, now));
        let removed = before - map.len();
        drop(map);

        let retention = self.settings.retention;
        self.recent
            .lock()
            .expect("dedup mutex poisoned")
            .retain(|r| now - r.seen < retention);
        removed
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("dedup mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
