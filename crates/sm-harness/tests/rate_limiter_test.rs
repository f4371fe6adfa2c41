use std::sync::Arc;
use std::time::Duration;

use sm_harness::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter, TokenEstimate};
use tokio::sync::Mutex;

async fn drain_requests(limiter: &RateLimiter, n: usize) {
    for _ in 0..n {
        limiter.try_acquire(TokenEstimate::request()).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn allows_requests_within_limit() {
    let limiter = RateLimiter::new(RateLimitConfig::per_minute(10));
    for _ in 0..10 {
        assert!(limiter.try_acquire(TokenEstimate::request()).await.is_ok());
    }
    assert!(matches!(
        limiter.try_acquire(TokenEstimate::request()).await,
        Err(RateLimitError::Exceeded { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn refill_matches_elapsed_time() {
    // 60 per minute = 1 per second.
    let limiter = RateLimiter::new(RateLimitConfig::per_minute(60));
    drain_requests(&limiter, 60).await;
    assert_eq!(limiter.available().await.requests, Some(0.0));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(limiter.available().await.requests, Some(5.0));

    drain_requests(&limiter, 5).await;
    assert!(limiter.try_acquire(TokenEstimate::request()).await.is_err());

    // Refill never exceeds capacity.
    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(limiter.available().await.requests, Some(60.0));
}

#[tokio::test(start_paused = true)]
async fn token_buckets_are_independent() {
    let limiter = RateLimiter::new(
        RateLimitConfig::unlimited()
            .with_token_limits(Some(1_000), Some(600))
            .rejecting(),
    );
    limiter.acquire(TokenEstimate::new(900, 100)).await.unwrap();

    // Input bucket is short even though output has room.
    let err = limiter.acquire(TokenEstimate::new(200, 10)).await.unwrap_err();
    assert!(matches!(err, RateLimitError::Exceeded { .. }));

    // A failed acquire debits nothing.
    let avail = limiter.available().await;
    assert_eq!(avail.input_tokens, Some(100.0));
    assert_eq!(avail.output_tokens, Some(500.0));
    assert_eq!(avail.requests, None);
}

#[tokio::test(start_paused = true)]
async fn queued_caller_is_served_after_refill() {
    let limiter = RateLimiter::new(
        RateLimitConfig::per_minute(60).with_queue(10, Duration::from_secs(30)),
    );
    drain_requests(&limiter, 60).await;

    let start = tokio::time::Instant::now();
    limiter.acquire(TokenEstimate::request()).await.unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(999), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(1_100), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn queue_timeout_never_succeeds_late() {
    // One request per minute.
    let limiter = RateLimiter::new(
        RateLimitConfig::per_minute(1).with_queue(10, Duration::from_secs(1)),
    );
    drain_requests(&limiter, 1).await;

    let err = limiter.acquire(TokenEstimate::request()).await.unwrap_err();
    match err {
        RateLimitError::Timeout { waited } => assert!(waited >= Duration::from_secs(1)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(limiter.queue_len().await, 0);

    // The token that refills later is still there: the timed-out caller
    // did not take it.
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(limiter.available().await.requests, Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn queue_is_served_in_arrival_order() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::per_minute(60).with_queue(10, Duration::from_secs(30)),
    ));
    drain_requests(&limiter, 60).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..3 {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            limiter.acquire(TokenEstimate::request()).await.unwrap();
            order.lock().await.push(i);
        }));
        // Let the task enqueue before spawning the next one.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(*order.lock().await, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::per_minute(1).with_queue(1, Duration::from_secs(120)),
    ));
    drain_requests(&limiter, 1).await;

    let waiter = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire(TokenEstimate::request()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(limiter.queue_len().await, 1);

    let err = limiter.acquire(TokenEstimate::request()).await.unwrap_err();
    assert_eq!(err, RateLimitError::QueueFull { max: 1 });

    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_never_overspend() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::per_minute(10)
            .with_queue(100, Duration::from_millis(500)),
    ));
    let mut handles = Vec::new();
    for _ in 0..40 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire(TokenEstimate::request()).await.is_ok()
        }));
    }
    let mut granted = 0;
    for h in handles {
        if h.await.unwrap() {
            granted += 1;
        }
    }
    // 10 up front, at most one more refilled within the 500ms wait.
    assert!(granted >= 10 && granted <= 11, "granted {granted}");
}

#[tokio::test(start_paused = true)]
async fn abandoned_waiter_leaves_the_queue() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::per_minute(1).with_queue(10, Duration::from_secs(120)),
    ));
    drain_requests(&limiter, 1).await;

    let abandoned = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire(TokenEstimate::request()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(limiter.queue_len().await, 1);

    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());
    assert_eq!(limiter.queue_len().await, 0);

    // The refilled token goes to the next caller instead of timing out
    // behind a dead ticket.
    let start = tokio::time::Instant::now();
    limiter.acquire(TokenEstimate::request()).await.unwrap();
    assert!(start.elapsed() <= Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_head_wakes_the_next_waiter() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::per_minute(1).with_queue(10, Duration::from_secs(120)),
    ));
    drain_requests(&limiter, 1).await;

    let head = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire(TokenEstimate::request()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let next = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire(TokenEstimate::request()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(limiter.queue_len().await, 2);

    head.abort();
    assert!(next.await.unwrap().is_ok());
    assert_eq!(limiter.queue_len().await, 0);
}
