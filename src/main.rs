//! News ingestor service entrypoint.
//! Loads config, starts the scheduler lanes and periodic triggers, and serves
//! the trigger/inspection API next to `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_ingestor::api::{create_router, AppState};
use news_ingestor::ingest::config::load_config_default;
use news_ingestor::ingest::job::{JobClass, JobRegistry};
use news_ingestor::ingest::pipeline::Ingestor;
use news_ingestor::ingest::scheduler::Scheduler;
use news_ingestor::metrics::Metrics;

/// `LOG_FORMAT=json` switches to structured output; compact otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,news_ingestor=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Shuttle may have installed a subscriber already; keep theirs if so.
    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading ingest config")?;
    let metrics = Metrics::init(cfg.enabled_sources().count())?;

    let ingestor = Arc::new(Ingestor::from_config(&cfg)?);
    let registry = Arc::new(JobRegistry::with_capacity(cfg.scheduler.job_history));
    let scheduler = Scheduler::start(ingestor, registry, &cfg.lanes);

    scheduler.schedule_periodic(
        JobClass::Scrape,
        Duration::from_secs(cfg.scheduler.scrape_interval_secs.max(1)),
    );
    scheduler.schedule_periodic(
        JobClass::Cleanup,
        Duration::from_secs(cfg.scheduler.cleanup_interval_secs.max(1)),
    );

    tracing::info!(
        target: "scheduler",
        sources = cfg.enabled_sources().count(),
        lanes = cfg.lanes.len(),
        "ingestor started"
    );

    let router = create_router(AppState::new(scheduler)).merge(metrics.router());
    Ok(router.into())
}
