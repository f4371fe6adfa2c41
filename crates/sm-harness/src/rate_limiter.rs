use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised by [`RateLimiter::acquire`].
///
/// `Timeout` is the distinct rate-limit-timeout error: a queued caller whose
/// wait exceeded its budget. It is never followed by a late success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Not enough capacity right now and queueing is disabled.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    Exceeded { retry_after: Duration },

    #[error("rate limit queue is full ({max} waiting)")]
    QueueFull { max: usize },

    #[error("rate limit wait timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// The estimate is larger than the bucket can ever hold.
    #[error("{bucket} estimate {requested} exceeds bucket capacity {capacity}")]
    ExceedsCapacity {
        bucket: &'static str,
        requested: u64,
        capacity: u64,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per minute. `None` = unlimited.
    pub rpm: Option<u64>,
    /// Input tokens per minute.
    pub itpm: Option<u64>,
    /// Output tokens per minute.
    pub otpm: Option<u64>,
    pub queue_when_limited: bool,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
}

impl RateLimitConfig {
    /// No limits at all.
    pub fn unlimited() -> Self {
        Self {
            rpm: None,
            itpm: None,
            otpm: None,
            queue_when_limited: true,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(60),
        }
    }

    pub fn per_minute(rpm: u64) -> Self {
        Self {
            rpm: Some(rpm),
            ..Self::unlimited()
        }
    }

    pub fn with_token_limits(mut self, itpm: Option<u64>, otpm: Option<u64>) -> Self {
        self.itpm = itpm;
        self.otpm = otpm;
        self
    }

    pub fn with_queue(mut self, max_queue_size: usize, queue_timeout: Duration) -> Self {
        self.queue_when_limited = true;
        self.max_queue_size = max_queue_size;
        self.queue_timeout = queue_timeout;
        self
    }

    /// Reject immediately instead of queueing.
    pub fn rejecting(mut self) -> Self {
        self.queue_when_limited = false;
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl From<&sm_core::config::RateLimitConfig> for RateLimitConfig {
    fn from(cfg: &sm_core::config::RateLimitConfig) -> Self {
        Self {
            rpm: cfg.rpm,
            itpm: cfg.itpm,
            otpm: cfg.otpm,
            queue_when_limited: cfg.queue_when_limited,
            max_queue_size: cfg.max_queue_size,
            queue_timeout: Duration::from_millis(cfg.queue_timeout_ms),
        }
    }
}

/// What one invocation expects to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenEstimate {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenEstimate {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            requests: 1,
            input_tokens,
            output_tokens,
        }
    }

    /// A single request with no token cost.
    pub fn request() -> Self {
        Self::new(0, 0)
    }
}

/// Tokens currently available per bucket. `None` = unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Availability {
    pub requests: Option<f64>,
    pub input_tokens: Option<f64>,
    pub output_tokens: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(capacity: u64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn rate_per_second(&self) -> f64 {
        self.capacity / 60.0
    }

    /// `available = min(capacity, available + elapsed * capacity / 60)`.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second()).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `cost` tokens are available (zero if they already are).
    fn time_until(&self, cost: f64) -> Duration {
        if self.tokens >= cost {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((cost - self.tokens) / self.rate_per_second())
        }
    }
}

struct Waiter {
    ticket: u64,
    notify: Arc<Notify>,
}

struct LimiterState {
    requests: Option<TokenBucket>,
    input: Option<TokenBucket>,
    output: Option<TokenBucket>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LimiterState {
    fn refill(&mut self, now: Instant) {
        for bucket in [&mut self.requests, &mut self.input, &mut self.output]
            .into_iter()
            .flatten()
        {
            bucket.refill(now);
        }
    }

    /// Debit all three buckets or none. On shortfall returns the wait until
    /// every bucket could cover its share.
    fn try_debit(&mut self, estimate: &TokenEstimate, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let wait = [
            (&self.requests, estimate.requests),
            (&self.input, estimate.input_tokens),
            (&self.output, estimate.output_tokens),
        ]
        .into_iter()
        .filter_map(|(bucket, cost)| bucket.as_ref().map(|b| b.time_until(cost as f64)))
        .max()
        .unwrap_or(Duration::ZERO);

        if !wait.is_zero() {
            return Err(wait);
        }
        for (bucket, cost) in [
            (&mut self.requests, estimate.requests),
            (&mut self.input, estimate.input_tokens),
            (&mut self.output, estimate.output_tokens),
        ] {
            if let Some(b) = bucket {
                b.tokens -= cost as f64;
            }
        }
        Ok(())
    }

    fn check_capacity(&self, estimate: &TokenEstimate) -> Result<(), RateLimitError> {
        for (name, bucket, cost) in [
            ("requests", &self.requests, estimate.requests),
            ("input_tokens", &self.input, estimate.input_tokens),
            ("output_tokens", &self.output, estimate.output_tokens),
        ] {
            if let Some(b) = bucket {
                if cost as f64 > b.capacity {
                    return Err(RateLimitError::ExceedsCapacity {
                        bucket: name,
                        requested: cost,
                        capacity: b.capacity as u64,
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove `ticket` from the queue, waking the new head if it changed.
    fn leave_queue(&mut self, ticket: u64) {
        let was_head = self.queue.front().map(|w| w.ticket) == Some(ticket);
        self.queue.retain(|w| w.ticket != ticket);
        if was_head {
            if let Some(next) = self.queue.front() {
                next.notify.notify_one();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Three-bucket token limiter (requests, input tokens, output tokens per
/// minute) with a bounded FIFO wait queue.
///
/// All bucket arithmetic happens under one lock, so concurrent callers can
/// never spend the same tokens twice. The lock is never held across an
/// await, which lets a dropped waiter leave the queue synchronously.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let state = LimiterState {
            requests: config.rpm.map(|c| TokenBucket::per_minute(c, now)),
            input: config.itpm.map(|c| TokenBucket::per_minute(c, now)),
            output: config.otpm.map(|c| TokenBucket::per_minute(c, now)),
            queue: VecDeque::new(),
            next_ticket: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Debit `estimate` without waiting. Fails if callers are already queued.
    pub async fn try_acquire(&self, estimate: TokenEstimate) -> Result<(), RateLimitError> {
        let mut state = self.lock();
        state.check_capacity(&estimate)?;
        if !state.queue.is_empty() {
            // Queued callers go first.
            return Err(RateLimitError::Exceeded {
                retry_after: Duration::ZERO,
            });
        }
        state
            .try_debit(&estimate, Instant::now())
            .map_err(|retry_after| RateLimitError::Exceeded { retry_after })
    }

    /// Debit `estimate`, queueing in arrival order when the buckets are short.
    pub async fn acquire(&self, estimate: TokenEstimate) -> Result<(), RateLimitError> {
        let started = Instant::now();
        let deadline = started + self.config.queue_timeout;

        let (ticket, notify) = {
            let mut state = self.lock();
            state.check_capacity(&estimate)?;
            if state.queue.is_empty() {
                match state.try_debit(&estimate, started) {
                    Ok(()) => return Ok(()),
                    Err(retry_after) if !self.config.queue_when_limited => {
                        warn!(?retry_after, "rate limit exceeded");
                        return Err(RateLimitError::Exceeded { retry_after });
                    }
                    Err(_) => {}
                }
            } else if !self.config.queue_when_limited {
                return Err(RateLimitError::Exceeded {
                    retry_after: Duration::ZERO,
                });
            }
            if state.queue.len() >= self.config.max_queue_size {
                warn!(max = self.config.max_queue_size, "rate limit queue full");
                return Err(RateLimitError::QueueFull {
                    max: self.config.max_queue_size,
                });
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let notify = Arc::new(Notify::new());
            state.queue.push_back(Waiter {
                ticket,
                notify: Arc::clone(&notify),
            });
            debug!(ticket, depth = state.queue.len(), "queued for rate limit");
            (ticket, notify)
        };
        // Leaves the queue however this future ends, including being dropped.
        let _place = QueuePlace {
            limiter: self,
            ticket,
        };

        loop {
            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                if now >= deadline {
                    state.leave_queue(ticket);
                    let waited = now.saturating_duration_since(started);
                    warn!(ticket, ?waited, "rate limit wait timed out");
                    return Err(RateLimitError::Timeout { waited });
                }
                if state.queue.front().map(|w| w.ticket) == Some(ticket) {
                    match state.try_debit(&estimate, now) {
                        Ok(()) => {
                            state.leave_queue(ticket);
                            debug!(ticket, "rate limit acquired after wait");
                            return Ok(());
                        }
                        Err(wait) => (now + wait).min(deadline),
                    }
                } else {
                    deadline
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Debit tokens the estimate under-counted, once the real usage is known.
    /// Buckets are clamped at zero.
    pub async fn settle(&self, estimate: TokenEstimate, actual: TokenEstimate) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.refill(Instant::now());
        for (bucket, est, act) in [
            (&mut state.input, estimate.input_tokens, actual.input_tokens),
            (&mut state.output, estimate.output_tokens, actual.output_tokens),
        ] {
            if let Some(b) = bucket {
                if act > est {
                    b.tokens = (b.tokens - (act - est) as f64).max(0.0);
                }
            }
        }
    }

    pub async fn available(&self) -> Availability {
        let mut state = self.lock();
        state.refill(Instant::now());
        Availability {
            requests: state.requests.as_ref().map(|b| b.tokens),
            input_tokens: state.input.as_ref().map(|b| b.tokens),
            output_tokens: state.output.as_ref().map(|b| b.tokens),
        }
    }

    /// Callers currently waiting in the queue.
    pub async fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }
}

/// A queued caller's place in line.
struct QueuePlace<'a> {
    limiter: &'a RateLimiter,
    ticket: u64,
}

impl Drop for QueuePlace<'_> {
    fn drop(&mut self) {
        // No-op when the ticket already left on success or timeout.
        self.limiter.lock().leave_queue(self.ticket);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_always_acquires() {
        let limiter = RateLimiter::new(RateLimitConfig::unlimited());
        for _ in 0..1000 {
            limiter.acquire(TokenEstimate::new(10_000, 10_000)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn estimate_over_capacity_is_rejected() {
        let limiter = RateLimiter::new(
            RateLimitConfig::unlimited().with_token_limits(Some(100), None),
        );
        let err = limiter.acquire(TokenEstimate::new(101, 0)).await.unwrap_err();
        assert!(matches!(err, RateLimitError::ExceedsCapacity { bucket: "input_tokens", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_clamps_at_zero() {
        let limiter = RateLimiter::new(
            RateLimitConfig::unlimited().with_token_limits(None, Some(100)),
        );
        limiter.acquire(TokenEstimate::new(0, 50)).await.unwrap();
        limiter
            .settle(TokenEstimate::new(0, 50), TokenEstimate::new(0, 500))
            .await;
        assert_eq!(limiter.available().await.output_tokens, Some(0.0));
    }
}
