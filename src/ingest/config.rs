// src/ingest/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::dedup::DedupSettings;
use crate::ingest::delivery::BackendConfig;
use crate::ingest::enrich::EnrichmentConfig;
use crate::ingest::job::JobClass;
use crate::ingest::providers::ContentFilters;
use crate::ingest::retry::RetryPolicy;
use crate::ingest::scheduler::{LaneConfig, OverlapPolicy};
use crate::ingest::types::SourceDescriptor;

pub const ENV_CONFIG_PATH: &str = "INGEST_CONFIG_PATH";
pub const ENV_NEWS_API_KEY: &str = "NEWS_API_KEY";
pub const ENV_BACKEND_API_KEY: &str = "BACKEND_API_KEY";
pub const ENV_BACKEND_URL: &str = "BACKEND_URL";
pub const ENV_ML_SERVICE_URL: &str = "ML_SERVICE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub retention_hours: u64,
    /// Cosine similarity at or above which an article is a near-duplicate.
    /// Absent disables the tier.
    pub near_duplicate_threshold: Option<f32>,
    pub near_window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_hours: 48,
            near_duplicate_threshold: None,
            near_window: 500,
        }
    }
}

impl DedupConfig {
    pub fn settings(&self) -> DedupSettings {
        DedupSettings {
            retention: chrono::Duration::hours(self.retention_hours.min(876_000) as i64),
            near_threshold: self.near_duplicate_threshold,
            near_window: self.near_window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick of the periodic scrape trigger; each source is still paced by
    /// its own `scrape_interval_secs`.
    pub scrape_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_concurrent_sources: usize,
    /// Jobs kept in the registry for `/jobs`.
    pub job_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scrape_interval_secs: 60,
            cleanup_interval_secs: 3_600,
            max_concurrent_sources: 4,
            job_history: 200,
        }
    }
}

fn default_lanes() -> Vec<LaneConfig> {
    vec![
        LaneConfig {
            class: JobClass::Scrape,
            workers: 2,
            capacity: 16,
            overlap: OverlapPolicy::Skip,
        },
        LaneConfig {
            class: JobClass::Enrich,
            workers: 2,
            capacity: 64,
            overlap: OverlapPolicy::Queue,
        },
        LaneConfig {
            class: JobClass::Cleanup,
            workers: 1,
            capacity: 4,
            overlap: OverlapPolicy::Skip,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub backend: BackendConfig,
    pub enrichment: EnrichmentConfig,
    pub retry: RetryPolicy,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub filters: ContentFilters,
    pub scheduler: SchedulerConfig,
    pub lanes: Vec<LaneConfig>,
    pub sources: Vec<SourceDescriptor>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            user_agent: format!("news-ingestor/{}", env!("CARGO_PKG_VERSION")),
            backend: BackendConfig::default(),
            enrichment: EnrichmentConfig::default(),
            retry: RetryPolicy::default(),
            dedup: DedupConfig::default(),
            delivery: DeliveryConfig::default(),
            filters: ContentFilters::default(),
            scheduler: SchedulerConfig::default(),
            lanes: default_lanes(),
            sources: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Resolve `"ENV"` keys, apply env overrides, and sanity-check values.
    pub fn finalize(mut self) -> Result<Self> {
        if let Ok(url) = env::var(ENV_BACKEND_URL) {
            if !url.trim().is_empty() {
                self.backend.url = url.trim().to_string();
            }
        }
        if let Ok(url) = env::var(ENV_ML_SERVICE_URL) {
            if !url.trim().is_empty() {
                self.enrichment.url = url.trim().to_string();
            }
        }

        self.backend.api_key = match self.backend.api_key.take() {
            Some(k) if k.trim().eq_ignore_ascii_case("env") => Some(
                env::var(ENV_BACKEND_API_KEY)
                    .map_err(|_| anyhow!("Missing {ENV_BACKEND_API_KEY} env var"))?,
            ),
            other => other,
        };
        for s in &mut self.sources {
            if s.api_key
                .as_deref()
                .is_some_and(|k| k.trim().eq_ignore_ascii_case("env"))
            {
                s.api_key = Some(env::var(ENV_NEWS_API_KEY).map_err(|_| {
                    anyhow!("Missing {ENV_NEWS_API_KEY} env var (source `{}`)", s.id)
                })?);
            }
        }

        self.validate()?;

        for lane in default_lanes() {
            if !self.lanes.iter().any(|l| l.class == lane.class) {
                self.lanes.push(lane);
            }
        }
        if let Some(t) = self.dedup.near_duplicate_threshold {
            self.dedup.near_duplicate_threshold = Some(if t.is_nan() { 1.0 } else { t.clamp(0.0, 1.0) });
        }
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.delivery.batch_size == 0 {
            bail!("delivery.batch_size must be >= 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        let mut ids = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() {
                bail!("source with empty id");
            }
            if !ids.insert(s.id.as_str()) {
                bail!("duplicate source id `{}`", s.id);
            }
        }
        let mut classes = HashSet::new();
        for l in &self.lanes {
            if !classes.insert(l.class) {
                bail!("duplicate lane for job class `{}`", l.class);
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<IngestConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading ingest config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing ingest config {}", path.display()))?
        .finalize()
}

/// Load config using env var + fallbacks:
/// 1) $INGEST_CONFIG_PATH
/// 2) config/ingest.toml
/// 3) config/ingest.json
/// 4) built-in defaults (no sources)
pub fn load_config_default() -> Result<IngestConfig> {
    if let Ok(p) = env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/ingest.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/ingest.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    IngestConfig::default().finalize()
}

fn parse_config(s: &str, hint_ext: &str) -> Result<IngestConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        // Unknown extension: JSON if it looks like an object, else TOML.
        _ if s.trim_start().starts_with('{') => Ok(serde_json::from_str(s)?),
        _ => Ok(toml::from_str(s)?),
    }
}
