// tests/politeness.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use news_ingestor::ingest::limiter::PolitenessLimiter;
use news_ingestor::ingest::types::{
    Politeness, SourceDescriptor, SourceKind, MAX_REQUEST_INTERVAL,
};

#[tokio::test(start_paused = true)]
async fn ten_concurrent_requests_at_two_per_second() {
    let mut src = SourceDescriptor::new("wire", SourceKind::Feed, "http://unused");
    src.politeness = Politeness {
        max_requests_per_sec: 2.0,
        min_delay_ms: 0,
    };
    let limiter = Arc::new(PolitenessLimiter::from_sources(&[src]));

    let t0 = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let l = limiter.clone();
        handles.push(tokio::spawn(async move {
            l.acquire("wire").await;
            Instant::now()
        }));
    }
    let mut stamps = Vec::new();
    for h in handles {
        stamps.push(h.await.unwrap());
    }
    stamps.sort();

    assert!(t0.elapsed() >= Duration::from_millis(4_500));
    for w in stamps.windows(2) {
        assert!(w[1] - w[0] >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn min_delay_wins_over_rate() {
    let limiter = PolitenessLimiter::new();
    limiter.register(
        "slow",
        &Politeness {
            max_requests_per_sec: 10.0,
            min_delay_ms: 1_000,
        },
    );
    assert_eq!(limiter.interval_of("slow"), Duration::from_secs(1));

    let t0 = Instant::now();
    for _ in 0..3 {
        limiter.acquire("slow").await;
    }
    assert!(t0.elapsed() >= Duration::from_secs(2));
}

#[test]
fn unregistered_sources_get_the_default_pace() {
    let limiter = PolitenessLimiter::new();
    assert_eq!(
        limiter.interval_of("anything"),
        Politeness::default().interval()
    );
    assert_eq!(Politeness::default().interval(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn vanishing_rate_saturates_at_the_ceiling() {
    let mut src = SourceDescriptor::new("glacial", SourceKind::Feed, "http://unused");
    src.politeness = Politeness {
        max_requests_per_sec: 1e-30,
        min_delay_ms: 0,
    };
    let limiter = PolitenessLimiter::from_sources(&[src]);
    assert_eq!(limiter.interval_of("glacial"), MAX_REQUEST_INTERVAL);

    // the first slot is free and claiming it must not overflow the clock
    let t0 = Instant::now();
    limiter.acquire("glacial").await;
    assert_eq!(t0.elapsed(), Duration::ZERO);
}
