// src/ingest/scheduler.rs
//! Periodic and ad-hoc triggers feeding bounded per-class lanes, each drained
//! by its own worker pool. Scrape jobs hand their fresh articles to the
//! processing lane so a slow enrichment service never holds a scraping worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ingest::error::IngestError;
use crate::ingest::job::{
    IngestionJob, JobClass, JobId, JobRegistry, JobStats, JobStatus, JobTarget, TriggerKind,
};
use crate::ingest::pipeline::{Handoff, Ingestor};

/// What a periodic trigger does when the previous whole-catalog job of its
/// class has not finished yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Queue,
}

fn default_workers() -> usize {
    1
}
fn default_capacity() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    pub class: JobClass,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

/// Last-fired bookkeeping; firing is a pure function of it and the clock.
#[derive(Debug, Clone)]
pub struct PeriodicTrigger {
    interval: chrono::Duration,
    last_fired: Option<DateTime<Utc>>,
}

impl PeriodicTrigger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            last_fired: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_fired.map_or(true, |t| now - t >= self.interval)
    }

    /// Time left until the next firing; zero when already due.
    pub fn next_due(&self, now: DateTime<Utc>) -> Duration {
        match self.last_fired {
            None => Duration::ZERO,
            Some(t) => (t + self.interval - now).to_std().unwrap_or(Duration::ZERO),
        }
    }

    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired = Some(now);
    }
}

struct JobRequest {
    job_id: JobId,
    cancel: CancellationToken,
    /// Present on processing jobs only.
    handoff: Option<Handoff>,
}

struct Lane {
    tx: mpsc::Sender<JobRequest>,
    overlap: OverlapPolicy,
}

/// Lane senders plus the bookkeeping every submission touches. Shared by the
/// scheduler and its workers, which submit processing jobs themselves.
struct Dispatcher {
    registry: Arc<JobRegistry>,
    lanes: HashMap<JobClass, Lane>,
    cancels: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    fn has_lane(&self, class: JobClass) -> bool {
        self.lanes.contains_key(&class)
    }

    fn submit(
        &self,
        class: JobClass,
        target: JobTarget,
        trigger: TriggerKind,
        cancel: CancellationToken,
        handoff: Option<Handoff>,
    ) -> IngestionJob {
        let job = self.registry.create(class, target, trigger);

        let Some(lane) = self.lanes.get(&class) else {
            return self.reject(job, "lane not configured");
        };
        if self.shutdown.is_cancelled() {
            return self.reject(job, "scheduler shut down");
        }

        self.cancels
            .lock()
            .expect("cancel map mutex poisoned")
            .insert(job.id, cancel.clone());

        match lane.tx.try_send(JobRequest {
            job_id: job.id,
            cancel,
            handoff,
        }) {
            Ok(()) => {
                tracing::debug!(target: "scheduler", job_id = job.id, %class, trigger = ?trigger, "job queued");
                job
            }
            Err(e) => {
                self.forget(job.id);
                let why = match e {
                    TrySendError::Full(_) => "lane full",
                    TrySendError::Closed(_) => "lane closed",
                };
                self.reject(job, why)
            }
        }
    }

    fn reject(&self, job: IngestionJob, why: &str) -> IngestionJob {
        tracing::warn!(target: "scheduler", job_id = job.id, class = %job.class, lane = job.class.lane(), reason = why, "no worker available");
        counter!("ingest_jobs_total", "status" => "failed").increment(1);
        let id = job.id;
        self.registry
            .fail(id, format!("no worker available ({why})"))
            .unwrap_or(job)
    }

    /// Queue one source's fresh articles on the processing lane. Articles no
    /// worker accepts are counted as abandoned on the scrape job.
    fn hand_off(&self, parent: &IngestionJob, handoff: Handoff, cancel: &CancellationToken, stats: &mut JobStats) {
        let n = handoff.articles.len();
        let source = handoff.source_id.clone();
        let target = JobTarget::Handoff {
            source: source.clone(),
            parent: parent.id,
            articles: n,
        };
        let child = self.submit(
            JobClass::Enrich,
            target,
            parent.trigger,
            cancel.child_token(),
            Some(handoff),
        );
        if child.status == JobStatus::Failed {
            stats.abandoned += n;
            stats.push_error(format!(
                "{source}: {n} articles not handed off ({})",
                child.failure.as_deref().unwrap_or("rejected")
            ));
        } else {
            stats.handed_off += n;
            tracing::debug!(target: "scheduler", job_id = parent.id, child = child.id, source = %source, articles = n, "handed off");
        }
    }

    fn forget(&self, id: JobId) {
        self.cancels
            .lock()
            .expect("cancel map mutex poisoned")
            .remove(&id);
    }
}

pub struct Scheduler {
    ingestor: Arc<Ingestor>,
    dispatch: Arc<Dispatcher>,
    source_triggers: Mutex<HashMap<String, PeriodicTrigger>>,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create the lanes and spawn their workers. Must run inside a tokio runtime.
    pub fn start(ingestor: Arc<Ingestor>, registry: Arc<JobRegistry>, lanes: &[LaneConfig]) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut lane_map = HashMap::new();
        let mut receivers = Vec::new();

        for cfg in lanes {
            let (tx, rx) = mpsc::channel::<JobRequest>(cfg.capacity.max(1));
            lane_map.insert(
                cfg.class,
                Lane {
                    tx,
                    overlap: cfg.overlap,
                },
            );
            receivers.push((cfg, Arc::new(tokio::sync::Mutex::new(rx))));
        }

        let dispatch = Arc::new(Dispatcher {
            registry,
            lanes: lane_map,
            cancels: Mutex::new(HashMap::new()),
            shutdown,
        });

        for (cfg, rx) in receivers {
            for worker in 0..cfg.workers.max(1) {
                tracker.spawn(worker_loop(
                    WorkerCtx {
                        lane: cfg.class.lane(),
                        worker,
                        ingestor: ingestor.clone(),
                        dispatch: dispatch.clone(),
                    },
                    rx.clone(),
                ));
            }
            tracing::info!(target: "scheduler", lane = cfg.class.lane(), workers = cfg.workers.max(1), capacity = cfg.capacity.max(1), overlap = ?cfg.overlap, "lane started");
        }
        if !dispatch.has_lane(JobClass::Enrich) {
            tracing::info!(target: "scheduler", "no processing lane; scrape jobs enrich and deliver inline");
        }

        Arc::new(Self {
            ingestor,
            dispatch,
            source_triggers: Mutex::new(HashMap::new()),
            tracker,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.dispatch.registry
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Register a recurring trigger for `class`. The first firing is immediate.
    pub fn schedule_periodic(self: &Arc<Self>, class: JobClass, interval: Duration) {
        let this = self.clone();
        self.tracker.spawn(async move {
            let mut trigger = PeriodicTrigger::new(interval);
            tracing::info!(target: "scheduler", %class, interval_secs = interval.as_secs(), "periodic trigger registered");
            loop {
                let wait = trigger.next_due(Utc::now());
                tokio::select! {
                    _ = this.dispatch.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                trigger.mark_fired(Utc::now());
                this.fire_periodic(class);
            }
        });
    }

    /// One periodic firing. Returns the enqueued job, or `None` when the
    /// firing was skipped (overlap policy) or nothing was due.
    pub fn fire_periodic(&self, class: JobClass) -> Option<IngestionJob> {
        if class == JobClass::Enrich {
            tracing::debug!(target: "scheduler", "processing jobs are created by scrape handoffs only");
            return None;
        }
        let overlap = self
            .dispatch
            .lanes
            .get(&class)
            .map(|l| l.overlap)
            .unwrap_or_default();
        if overlap == OverlapPolicy::Skip && self.registry().catalog_job_active(class) {
            tracing::info!(target: "scheduler", %class, "previous catalog job still active; skipping trigger");
            counter!("ingest_jobs_skipped_total", "class" => class.to_string()).increment(1);
            return None;
        }

        let target = match class {
            JobClass::Cleanup => JobTarget::Catalog(Vec::new()),
            _ => {
                let now = Utc::now();
                let mut triggers = self.source_triggers.lock().expect("trigger mutex poisoned");
                let due: Vec<String> = self
                    .ingestor
                    .sources()
                    .iter()
                    .filter(|s| s.enabled)
                    .filter(|s| {
                        triggers
                            .entry(s.id.clone())
                            .or_insert_with(|| {
                                PeriodicTrigger::new(Duration::from_secs(s.scrape_interval_secs))
                            })
                            .is_due(now)
                    })
                    .map(|s| s.id.clone())
                    .collect();
                if due.is_empty() {
                    tracing::debug!(target: "scheduler", "no source due");
                    return None;
                }
                for id in &due {
                    if let Some(t) = triggers.get_mut(id) {
                        t.mark_fired(now);
                    }
                }
                JobTarget::Catalog(due)
            }
        };
        Some(self.enqueue(class, target, TriggerKind::Periodic))
    }

    /// Ad-hoc scrape of one source, or of every enabled source when `None`.
    pub fn trigger_now(&self, source_id: Option<&str>) -> Result<IngestionJob, IngestError> {
        let target = match source_id {
            Some(id) => {
                let known = self
                    .ingestor
                    .source(id)
                    .is_some_and(|s| s.enabled);
                if !known {
                    return Err(IngestError::UnknownSource(id.to_string()));
                }
                JobTarget::Source(id.to_string())
            }
            None => JobTarget::Catalog(
                self.ingestor
                    .sources()
                    .iter()
                    .filter(|s| s.enabled)
                    .map(|s| s.id.clone())
                    .collect(),
            ),
        };
        Ok(self.enqueue(JobClass::Scrape, target, TriggerKind::Manual))
    }

    /// Ad-hoc fingerprint sweep.
    pub fn trigger_cleanup(&self) -> IngestionJob {
        self.enqueue(JobClass::Cleanup, JobTarget::Catalog(Vec::new()), TriggerKind::Manual)
    }

    fn enqueue(&self, class: JobClass, target: JobTarget, trigger: TriggerKind) -> IngestionJob {
        self.dispatch
            .submit(class, target, trigger, CancellationToken::new(), None)
    }

    /// Request cooperative cancellation. `false` if the job is unknown or finished.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let token = self
            .dispatch
            .cancels
            .lock()
            .expect("cancel map mutex poisoned")
            .get(&job_id)
            .cloned();
        match token {
            Some(t) => {
                t.cancel();
                // a queued job is settled right away; a running one when it yields
                self.registry().cancel_pending(job_id);
                tracing::info!(target: "scheduler", job_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Stop periodic triggers, let running jobs finish, cancel queued ones.
    pub async fn shutdown(&self) {
        self.dispatch.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(target: "scheduler", "scheduler stopped");
    }
}

struct WorkerCtx {
    lane: &'static str,
    worker: usize,
    ingestor: Arc<Ingestor>,
    dispatch: Arc<Dispatcher>,
}

async fn worker_loop(ctx: WorkerCtx, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<JobRequest>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.dispatch.shutdown.cancelled() => None,
                r = rx.recv() => r,
            }
        };
        let Some(req) = next else { break };
        run_request(&ctx, req).await;
    }

    // drain whatever is still queued
    let mut rx = rx.lock().await;
    while let Ok(req) = rx.try_recv() {
        ctx.dispatch.registry.cancel_pending(req.job_id);
        ctx.dispatch.forget(req.job_id);
    }
    tracing::debug!(target: "scheduler", lane = ctx.lane, worker = ctx.worker, "worker stopped");
}

async fn run_request(ctx: &WorkerCtx, req: JobRequest) {
    let registry = &ctx.dispatch.registry;
    let job = if req.cancel.is_cancelled() {
        None
    } else {
        registry.mark_running(req.job_id)
    };
    let Some(job) = job else {
        registry.cancel_pending(req.job_id);
        ctx.dispatch.forget(req.job_id);
        return;
    };

    tracing::info!(target: "scheduler", job_id = job.id, class = %job.class, lane = ctx.lane, worker = ctx.worker, "job started");
    let stats = match req.handoff {
        Some(handoff) => ctx.ingestor.process(handoff, job.id, &req.cancel).await,
        None if job.class == JobClass::Scrape && ctx.dispatch.has_lane(JobClass::Enrich) => {
            let (mut stats, handoffs) = ctx.ingestor.clone().collect(&job, req.cancel.clone()).await;
            for handoff in handoffs {
                if req.cancel.is_cancelled() {
                    stats.interrupt(handoff.articles.len());
                    continue;
                }
                ctx.dispatch.hand_off(&job, handoff, &req.cancel, &mut stats);
            }
            stats
        }
        None => ctx.ingestor.clone().run_job(&job, req.cancel.clone()).await,
    };
    // a cancel that lands after the last unit of work changes nothing
    let cancelled = stats.interrupted;
    let done = registry.finish(job.id, stats, cancelled);
    ctx.dispatch.forget(job.id);

    if let Some(done) = done {
        counter!("ingest_jobs_total", "status" => done.status.as_str()).increment(1);
        gauge!("ingest_last_job_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "scheduler",
            job_id = done.id,
            class = %done.class,
            status = done.status.as_str(),
            fetched = done.stats.fetched,
            deduped = done.stats.deduped_out,
            handed_off = done.stats.handed_off,
            delivered = done.stats.delivered,
            failed_batches = done.stats.failed_batches,
            abandoned = done.stats.abandoned,
            retries = done.stats.retries,
            source_errors = done.stats.source_errors,
            "job finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_trigger_is_pure_over_clock() {
        let t0 = Utc::now();
        let mut t = PeriodicTrigger::new(Duration::from_secs(60));
        assert!(t.is_due(t0));
        assert_eq!(t.next_due(t0), Duration::ZERO);

        t.mark_fired(t0);
        assert!(!t.is_due(t0 + chrono::Duration::seconds(59)));
        assert_eq!(
            t.next_due(t0 + chrono::Duration::seconds(20)),
            Duration::from_secs(40)
        );
        assert!(t.is_due(t0 + chrono::Duration::seconds(60)));
        assert_eq!(t.next_due(t0 + chrono::Duration::seconds(90)), Duration::ZERO);
    }

    #[test]
    fn lane_config_defaults() {
        let l: LaneConfig = serde_json::from_str(r#"{"class":"cleanup"}"#).unwrap();
        assert_eq!(l.class, JobClass::Cleanup);
        assert_eq!(l.workers, 1);
        assert_eq!(l.overlap, OverlapPolicy::Skip);
    }
}
