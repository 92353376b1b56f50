// src/ingest/job.rs
//! Ingestion jobs, their statistics, and an in-memory registry of recent jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::delivery::BatchOutcome;

pub type JobId = u64;

/// Most error strings kept per job.
pub const MAX_ERROR_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    /// fetch → dedup, then hand off to `Enrich`
    Scrape,
    /// enrich → deliver one source's deduplicated articles
    Enrich,
    /// sweep expired fingerprints
    Cleanup,
}

impl JobClass {
    /// Name of the lane serving this class.
    pub fn lane(&self) -> &'static str {
        match self {
            JobClass::Scrape => "scraping",
            JobClass::Enrich => "processing",
            JobClass::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobClass::Scrape => "scrape",
            JobClass::Enrich => "enrich",
            JobClass::Cleanup => "cleanup",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Periodic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "lowercase")]
pub enum JobTarget {
    /// Whole-catalog run over the listed (enabled, due) sources.
    Catalog(Vec<String>),
    Source(String),
    /// Articles of `source` collected by scrape job `parent`.
    Handoff {
        source: String,
        parent: JobId,
        articles: usize,
    },
}

impl JobTarget {
    pub fn is_catalog(&self) -> bool {
        matches!(self, JobTarget::Catalog(_))
    }

    pub fn source_ids(&self) -> Vec<String> {
        match self {
            JobTarget::Catalog(ids) => ids.clone(),
            JobTarget::Source(id) => vec![id.clone()],
            JobTarget::Handoff { source, .. } => vec![source.clone()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    SucceededWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::SucceededWithErrors => "succeeded_with_errors",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub fetched: usize,
    pub stale: usize,
    pub malformed: usize,
    pub filtered: usize,
    pub deduped_out: usize,
    pub near_duplicates: usize,
    pub enriched: usize,
    pub enrich_failures: usize,
    /// Articles passed to the processing lane.
    pub handed_off: usize,
    /// Articles past dedup that were never delivered (cancelled, or no
    /// processing worker took them). Their fingerprints stay recorded.
    pub abandoned: usize,
    /// Set when cancellation cut the job short.
    pub interrupted: bool,
    /// Articles offered for delivery.
    pub total: usize,
    pub delivered: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub retries: u32,
    pub source_errors: usize,
    /// Fingerprint records removed by a cleanup job.
    pub swept: usize,
    pub errors: Vec<String>,
}

impl JobStats {
    pub fn push_error(&mut self, msg: impl Into<String>) {
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(msg.into());
        }
    }

    pub fn fold_batch(&mut self, o: &BatchOutcome) {
        self.total += o.size;
        self.delivered += o.sent;
        self.batches += 1;
        self.retries += o.attempts.saturating_sub(1);
        if let Some(err) = &o.error {
            self.failed_batches += 1;
            self.push_error(format!("batch {}: {err}", o.seq));
        }
    }

    pub fn merge(&mut self, other: JobStats) {
        self.fetched += other.fetched;
        self.stale += other.stale;
        self.malformed += other.malformed;
        self.filtered += other.filtered;
        self.deduped_out += other.deduped_out;
        self.near_duplicates += other.near_duplicates;
        self.enriched += other.enriched;
        self.enrich_failures += other.enrich_failures;
        self.handed_off += other.handed_off;
        self.abandoned += other.abandoned;
        self.interrupted |= other.interrupted;
        self.total += other.total;
        self.delivered += other.delivered;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.retries += other.retries;
        self.source_errors += other.source_errors;
        self.swept += other.swept;
        for e in other.errors {
            self.push_error(e);
        }
    }

    /// Cancellation observed with `n` articles still undelivered.
    pub fn interrupt(&mut self, n: usize) {
        self.interrupted = true;
        self.abandoned += n;
    }

    pub fn has_errors(&self) -> bool {
        self.failed_batches > 0 || self.source_errors > 0 || self.abandoned > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub class: JobClass,
    pub target: JobTarget,
    pub trigger: TriggerKind,
    pub status: JobStatus,
    pub triggered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: JobStats,
    /// Set only when the job itself failed (no worker available).
    pub failure: Option<String>,
}

/// Bounded in-memory job store; oldest finished jobs are evicted first.
#[derive(Debug)]
pub struct JobRegistry {
    inner: Mutex<BTreeMap<JobId, IngestionJob>>,
    next_id: AtomicU64,
    cap: usize,
}

impl JobRegistry {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            cap: cap.clamp(1, 10_000),
        }
    }

    pub fn create(&self, class: JobClass, target: JobTarget, trigger: TriggerKind) -> IngestionJob {
        let job = IngestionJob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            class,
            target,
            trigger,
            status: JobStatus::Pending,
            triggered_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stats: JobStats::default(),
            failure: None,
        };
        let mut map = self.inner.lock().expect("job registry mutex poisoned");
        map.insert(job.id, job.clone());
        Self::evict_locked(&mut map, self.cap);
        job
    }

    fn evict_locked(map: &mut BTreeMap<JobId, IngestionJob>, cap: usize) {
        while map.len() > cap {
            let oldest_done = map
                .iter()
                .find(|(_, j)| j.status.is_terminal())
                .map(|(id, _)| *id);
            match oldest_done {
                Some(id) => {
                    map.remove(&id);
                }
                None => break,
            }
        }
    }

    fn update<F: FnOnce(&mut IngestionJob)>(&self, id: JobId, f: F) -> Option<IngestionJob> {
        let mut map = self.inner.lock().expect("job registry mutex poisoned");
        let job = map.get_mut(&id)?;
        f(job);
        Some(job.clone())
    }

    /// PENDING → RUNNING. Returns `None` if the job is unknown or already terminal.
    pub fn mark_running(&self, id: JobId) -> Option<IngestionJob> {
        let mut map = self.inner.lock().expect("job registry mutex poisoned");
        let job = map.get_mut(&id)?;
        if job.status != JobStatus::Pending {
            return None;
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Record the final stats and derive the terminal status. `cancelled`
    /// should only be set when cancellation actually skipped work.
    pub fn finish(&self, id: JobId, stats: JobStats, cancelled: bool) -> Option<IngestionJob> {
        self.update(id, |job| {
            job.status = if cancelled {
                JobStatus::Cancelled
            } else if stats.has_errors() {
                JobStatus::SucceededWithErrors
            } else {
                JobStatus::Succeeded
            };
            job.stats = stats;
            job.finished_at = Some(Utc::now());
        })
    }

    pub fn fail(&self, id: JobId, reason: impl Into<String>) -> Option<IngestionJob> {
        let reason = reason.into();
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.failure = Some(reason);
            job.finished_at = Some(Utc::now());
        })
    }

    /// Cancel a job that never started.
    pub fn cancel_pending(&self, id: JobId) -> Option<IngestionJob> {
        let mut map = self.inner.lock().expect("job registry mutex poisoned");
        let job = map.get_mut(&id)?;
        if job.status != JobStatus::Pending {
            return None;
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        Some(job.clone())
    }

    pub fn get(&self, id: JobId) -> Option<IngestionJob> {
        self.inner
            .lock()
            .expect("job registry mutex poisoned")
            .get(&id)
            .cloned()
    }

    /// Newest first.
    pub fn snapshot_last_n(&self, n: usize) -> Vec<IngestionJob> {
        let map = self.inner.lock().expect("job registry mutex poisoned");
        map.values().rev().take(n).cloned().collect()
    }

    /// Is a whole-catalog job of `class` pending or running?
    pub fn catalog_job_active(&self, class: JobClass) -> bool {
        let map = self.inner.lock().expect("job registry mutex poisoned");
        map.values().any(|j| {
            j.class == class && j.target.is_catalog() && !j.status.is_terminal()
        })
    }
}
