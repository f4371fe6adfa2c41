//! Frame-storm guard.
//!
//! A workflow that keeps writing state without making progress would replay
//! forever. Every pass is fingerprinted by its plan, state and record
//! statuses; the run aborts when the same fingerprint keeps coming back or
//! passes start faster than the configured rate.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use sm_core::reconcile::RenderContext;
use tokio::time::Instant;

/// Signatures kept for repeat detection.
const SIGNATURE_WINDOW: usize = 20;

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StormError {
    #[error("pass signature repeated {count} times without progress")]
    Repeated { count: usize },

    #[error("{count} passes within one second exceeds {limit}")]
    RateExceeded { count: usize, limit: u32 },
}

/// Fingerprint of one pass.
pub fn pass_signature(plan: &str, ctx: &RenderContext) -> u64 {
    let mut hasher = DefaultHasher::new();
    plan.hash(&mut hasher);
    for (key, value) in ctx.state() {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    let mut records: Vec<(&str, &str)> = ctx
        .records()
        .map(|r| (r.node_path.as_str(), r.status.as_str()))
        .collect();
    records.sort_unstable();
    records.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
pub struct FrameStormGuard {
    /// Zero disables repeat detection.
    repeat_limit: u32,
    /// Zero disables rate detection.
    max_per_second: u32,
    signatures: VecDeque<u64>,
    starts: VecDeque<Instant>,
}

impl FrameStormGuard {
    pub fn new(repeat_limit: u32, max_per_second: u32) -> Self {
        Self {
            repeat_limit,
            max_per_second,
            signatures: VecDeque::with_capacity(SIGNATURE_WINDOW),
            starts: VecDeque::new(),
        }
    }

    /// Record a pass that started at `now`.
    pub fn check(&mut self, signature: u64, now: Instant) -> Result<(), StormError> {
        if self.max_per_second > 0 {
            self.starts.push_back(now);
            while self
                .starts
                .front()
                .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
            {
                self.starts.pop_front();
            }
            if self.starts.len() > self.max_per_second as usize {
                return Err(StormError::RateExceeded {
                    count: self.starts.len(),
                    limit: self.max_per_second,
                });
            }
        }

        if self.repeat_limit > 0 {
            let seen = self.signatures.iter().filter(|s| **s == signature).count();
            if self.signatures.len() == SIGNATURE_WINDOW {
                self.signatures.pop_front();
            }
            self.signatures.push_back(signature);
            if seen >= self.repeat_limit as usize {
                return Err(StormError::Repeated { count: seen + 1 });
            }
        }
        Ok(())
    }
}
