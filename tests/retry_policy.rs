// tests/retry_policy.rs
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use news_ingestor::ingest::error::IngestError;
use news_ingestor::ingest::retry::{execute, execute_counted, RetryPolicy};

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let calls = &AtomicU32::new(0);
    let p = RetryPolicy::new(4, Duration::from_millis(100));
    let out = execute_counted(&p, "always-down", move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(IngestError::Server(503))
    })
    .await;

    assert!(matches!(out.result, Err(IngestError::Server(503))));
    assert_eq!(out.attempts, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn client_errors_fail_immediately() {
    let calls = &AtomicU32::new(0);
    let p = RetryPolicy::new(5, Duration::from_millis(100));
    let r = execute(&p, "forbidden", move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(IngestError::Client(403))
    })
    .await;

    assert!(matches!(r, Err(IngestError::Client(403))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn waits_grow_between_attempts() {
    let p = RetryPolicy::new(4, Duration::from_millis(100)).with_max_delay(Duration::from_secs(60));
    let t0 = tokio::time::Instant::now();
    let _ = execute(&p, "slow", || async { Err::<(), _>(IngestError::Timeout) }).await;
    // 100 + 200 + 400 ms of backoff, plus under 100 ms of jitter each
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_000), "{elapsed:?}");
}

#[test]
fn backoff_is_monotonic_until_capped() {
    let p = RetryPolicy::default();
    assert_eq!(p.max_attempts, 5);
    let waits: Vec<_> = (1..=10).map(|a| p.backoff(a)).collect();
    assert!(waits.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*waits.last().unwrap(), p.max_delay());
}

#[test]
fn retryable_taxonomy() {
    assert!(IngestError::Timeout.is_retryable());
    assert!(IngestError::Server(500).is_retryable());
    assert!(IngestError::RateLimited { retry_after: None }.is_retryable());
    assert!(IngestError::Malformed("x".into()).is_retryable());
    assert!(!IngestError::Client(404).is_retryable());
    assert!(!IngestError::UnknownSource("x".into()).is_retryable());
}
