// src/ingest/pipeline.rs
//! Per-source orchestration in two stages: collect (fetch → dedup) and
//! process (enrich → deliver).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ingest::config::IngestConfig;
use crate::ingest::dedup::{DedupCache, DedupVerdict};
use crate::ingest::delivery::{ArticleSink, DeliveryPipeline, HttpBackend};
use crate::ingest::enrich::{build_enricher, DisabledEnricher, DynEnricher};
use crate::ingest::ensure_metrics_described;
use crate::ingest::job::{IngestionJob, JobClass, JobId, JobStats};
use crate::ingest::limiter::PolitenessLimiter;
use crate::ingest::providers::FetchContext;
use crate::ingest::types::{Article, ConnectorRegistry, SourceDescriptor};

/// In-flight enrichment calls per source.
const ENRICH_CONCURRENCY: usize = 4;

/// Deduplicated articles of one source, waiting for enrichment and delivery.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub source_id: String,
    pub articles: Vec<Article>,
}

pub struct Ingestor {
    sources: Vec<SourceDescriptor>,
    connectors: ConnectorRegistry,
    fetch: FetchContext,
    dedup: Arc<DedupCache>,
    enricher: DynEnricher,
    delivery: DeliveryPipeline,
    max_concurrent_sources: usize,
}

impl Ingestor {
    /// Defaults: built-in connectors, enrichment off, one source at a time.
    pub fn new(
        sources: Vec<SourceDescriptor>,
        fetch: FetchContext,
        dedup: Arc<DedupCache>,
        delivery: DeliveryPipeline,
    ) -> Self {
        for s in &sources {
            fetch.limiter.register(&s.id, &s.politeness);
        }
        Self {
            sources,
            connectors: ConnectorRegistry::with_defaults(),
            fetch,
            dedup,
            enricher: Arc::new(DisabledEnricher),
            delivery,
            max_concurrent_sources: 1,
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_enricher(mut self, enricher: DynEnricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_max_concurrent_sources(mut self, n: usize) -> Self {
        self.max_concurrent_sources = n.max(1);
        self
    }

    /// Wire every collaborator from a finalized config.
    pub fn from_config(cfg: &IngestConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let limiter = Arc::new(PolitenessLimiter::from_sources(&cfg.sources));
        let fetch = FetchContext::new(
            client.clone(),
            limiter,
            cfg.retry,
            cfg.filters.clone(),
            timeout,
        );
        let dedup = Arc::new(DedupCache::new(cfg.dedup.settings()));
        let sink: Arc<dyn ArticleSink> = Arc::new(HttpBackend::new(client.clone(), &cfg.backend));
        let delivery = DeliveryPipeline::new(sink, cfg.retry, cfg.delivery.batch_size);

        Ok(Self::new(cfg.sources.clone(), fetch, dedup, delivery)
            .with_enricher(build_enricher(&cfg.enrichment, client))
            .with_max_concurrent_sources(cfg.scheduler.max_concurrent_sources))
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn source(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Execute one job to completion (or cancellation) on the calling task,
    /// scrape jobs included: every handoff is processed inline. Never fails:
    /// every error is contained and reported through the returned stats.
    pub async fn run_job(self: Arc<Self>, job: &IngestionJob, cancel: CancellationToken) -> JobStats {
        ensure_metrics_described();
        match job.class {
            JobClass::Cleanup => {
                let swept = self.dedup.sweep();
                tracing::info!(target: "ingest", job_id = job.id, swept, remaining = self.dedup.len(), "fingerprint sweep");
                JobStats {
                    swept,
                    ..JobStats::default()
                }
            }
            JobClass::Scrape => {
                let (mut stats, handoffs) = self.clone().collect(job, cancel.clone()).await;
                for handoff in handoffs {
                    stats.merge(self.process(handoff, job.id, &cancel).await);
                }
                stats
            }
            // processing jobs carry their articles with them; see `process`
            JobClass::Enrich => JobStats::default(),
        }
    }

    /// Scrape stage only: fetch and dedup every target source, returning the
    /// fresh articles per source in target order.
    pub async fn collect(
        self: Arc<Self>,
        job: &IngestionJob,
        cancel: CancellationToken,
    ) -> (JobStats, Vec<Handoff>) {
        ensure_metrics_described();
        let job_id = job.id;
        let permits = Arc::new(Semaphore::new(self.max_concurrent_sources));
        let mut set = JoinSet::new();
        let mut stats = JobStats::default();

        for (idx, id) in job.target.source_ids().into_iter().enumerate() {
            let Some(source) = self.source(&id).cloned() else {
                stats.source_errors += 1;
                stats.push_error(format!("{id}: unknown source"));
                continue;
            };
            let this = self.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    p = permits.acquire_owned() => p.ok(),
                    _ = cancel.cancelled() => None,
                };
                if permit.is_none() || cancel.is_cancelled() {
                    let mut skipped = JobStats::default();
                    skipped.interrupt(0);
                    return (idx, skipped, None);
                }
                let (s, h) = this.collect_source(&source, job_id, &cancel).await;
                (idx, s, h)
            });
        }

        let mut handoffs = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok((idx, s, h)) => {
                    stats.merge(s);
                    handoffs.extend(h.map(|h| (idx, h)));
                }
                Err(e) => {
                    stats.source_errors += 1;
                    stats.push_error(format!("source task aborted: {e}"));
                }
            }
        }
        handoffs.sort_by_key(|(idx, _)| *idx);
        (stats, handoffs.into_iter().map(|(_, h)| h).collect())
    }

    /// Full run for one source on the calling task: collect, then process.
    pub async fn ingest_source(
        &self,
        source: &SourceDescriptor,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> JobStats {
        let (mut stats, handoff) = self.collect_source(source, job_id, cancel).await;
        if let Some(handoff) = handoff {
            stats.merge(self.process(handoff, job_id, cancel).await);
        }
        stats
    }

    /// FETCHING → DEDUPING for one source. Fingerprints are only recorded
    /// when the job is still live.
    async fn collect_source(
        &self,
        source: &SourceDescriptor,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> (JobStats, Option<Handoff>) {
        let mut stats = JobStats::default();

        tracing::debug!(target: "ingest", job_id, source = %source.id, stage = "fetching");
        let report = match self.connectors.get(source.kind) {
            Ok(connector) => connector.fetch(source, &self.fetch).await,
            Err(e) => Err(e),
        };
        let report = match report {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(target: "ingest", job_id, source = %source.id, error = %e, "source fetch failed");
                counter!("ingest_source_errors_total").increment(1);
                stats.source_errors += 1;
                stats.push_error(format!("{}: {e}", source.id));
                return (stats, None);
            }
        };

        stats.fetched = report.fetched;
        stats.stale = report.stale;
        stats.malformed = report.malformed;
        stats.filtered = report.filtered;
        for e in &report.errors {
            stats.source_errors += 1;
            stats.push_error(format!("{}: {e}", source.id));
        }
        counter!("ingest_fetched_total").increment(report.fetched as u64);
        counter!("ingest_stale_total").increment(report.stale as u64);
        counter!("ingest_malformed_total").increment(report.malformed as u64);
        counter!("ingest_filtered_total").increment(report.filtered as u64);

        if cancel.is_cancelled() {
            tracing::info!(target: "ingest", job_id, source = %source.id, "cancelled before dedup; nothing recorded");
            stats.interrupt(0);
            return (stats, None);
        }

        tracing::debug!(target: "ingest", job_id, source = %source.id, stage = "deduping", candidates = report.articles.len());
        let mut fresh = Vec::with_capacity(report.articles.len());
        for article in report.articles {
            match self.dedup.check_and_record(&article) {
                DedupVerdict::Fresh => fresh.push(article),
                DedupVerdict::Duplicate(original) => {
                    stats.deduped_out += 1;
                    tracing::debug!(
                        target: "ingest",
                        source = %source.id,
                        url = %article.url,
                        original_source = %original.source_id,
                        original_url = %original.url,
                        "duplicate dropped"
                    );
                }
            }
        }
        counter!("ingest_dedup_total").increment(stats.deduped_out as u64);

        tracing::info!(
            target: "ingest",
            job_id,
            source = %source.id,
            fetched = stats.fetched,
            stale = stats.stale,
            malformed = stats.malformed,
            filtered = stats.filtered,
            deduped = stats.deduped_out,
            fresh = fresh.len(),
            "source collected"
        );
        if fresh.is_empty() {
            return (stats, None);
        }
        let handoff = Handoff {
            source_id: source.id.clone(),
            articles: fresh,
        };
        (stats, Some(handoff))
    }

    /// Enrich (when configured) and deliver one source's fresh articles.
    /// Anything left undelivered by a cancellation is counted as abandoned.
    pub async fn process(&self, handoff: Handoff, job_id: JobId, cancel: &CancellationToken) -> JobStats {
        ensure_metrics_described();
        let mut stats = JobStats::default();
        let Handoff { source_id, articles } = handoff;

        if cancel.is_cancelled() {
            stats.interrupt(articles.len());
            return stats;
        }
        let pending = articles.len();
        let to_send = tokio::select! {
            out = self.enrich_all(articles, &mut stats) => out,
            _ = cancel.cancelled() => {
                tracing::info!(target: "ingest", job_id, source = %source_id, "cancelled during enrichment");
                let mut cut = JobStats::default();
                cut.interrupt(pending);
                return cut;
            }
        };

        tracing::debug!(target: "ingest", job_id, source = %source_id, stage = "delivering", articles = to_send.len());
        self.delivery
            .deliver(&source_id, &to_send, &mut stats, cancel)
            .await;

        tracing::info!(
            target: "ingest",
            job_id,
            source = %source_id,
            enriched = stats.enriched,
            near_dup = stats.near_duplicates,
            delivered = stats.delivered,
            failed_batches = stats.failed_batches,
            abandoned = stats.abandoned,
            "source delivered"
        );
        stats
    }

    /// Attach enrichment (order preserved) and apply the near-duplicate tier.
    async fn enrich_all(&self, articles: Vec<Article>, stats: &mut JobStats) -> Vec<Article> {
        let results: Vec<_> = stream::iter(articles)
            .map(|a| {
                let enricher = self.enricher.clone();
                async move {
                    let r = enricher.enrich(&a).await;
                    (a, r)
                }
            })
            .buffered(ENRICH_CONCURRENCY)
            .collect()
            .await;

        let mut out = Vec::with_capacity(results.len());
        for (mut article, result) in results {
            match result {
                Ok(Some(enrichment)) => {
                    stats.enriched += 1;
                    if let Some(embedding) = enrichment.embedding.as_deref() {
                        if let Some(m) = self.dedup.near_duplicate_of(&article, embedding) {
                            stats.near_duplicates += 1;
                            counter!("ingest_near_dup_total").increment(1);
                            tracing::info!(
                                target: "ingest",
                                url = %article.url,
                                original_url = %m.original_url,
                                similarity = m.similarity,
                                "near-duplicate dropped"
                            );
                            continue;
                        }
                    }
                    if article.category.is_none() {
                        article.category = enrichment.category.clone();
                    }
                    article.enrichment = Some(enrichment);
                }
                Ok(None) => {}
                Err(e) => {
                    stats.enrich_failures += 1;
                    tracing::debug!(target: "ingest", url = %article.url, error = %e, "enrichment failed; delivering without");
                }
            }
            out.push(article);
        }
        out
    }
}
