//! Middleware pipeline around one invocation.
//!
//! A [`Pipeline`] is an ordered list of [`Middleware`] stages in front of a
//! base [`Invoke`]. Provider stages run outermost, then node stages, then the
//! built-in [`RetryStage`] and [`ValidationStage`], then the base call:
//!
//! ```text
//! provider.. -> node.. -> retry -> validation -> base
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sm_core::config::{RetryConfig, RetryOn};
use sm_core::record::{Outcome, TokenUsage};
use tracing::{debug, warn};

use crate::budget::BudgetError;
use crate::rate_limiter::{RateLimitError, TokenEstimate};
use crate::stop_condition::StopCondition;

// ---------------------------------------------------------------------------
// Options / outcome / error
// ---------------------------------------------------------------------------

/// Everything the base call needs to run one attempt.
#[derive(Clone)]
pub struct InvocationOptions {
    pub run_id: String,
    pub record_id: String,
    pub node_path: String,
    pub node_kind: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub stop_conditions: Vec<StopCondition>,
    pub estimate: TokenEstimate,
    /// 1-based attempt number, set by the retry stage.
    pub attempt: u32,
    pub chunk_transform: ChunkTransform,
}

impl std::fmt::Debug for InvocationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationOptions")
            .field("record_id", &self.record_id)
            .field("node_path", &self.node_path)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    /// `Completed` or `StopCondition`.
    pub outcome: Outcome,
    /// Accumulated output text.
    pub output: String,
    /// Final result text, when the agent reported one.
    pub result: Option<String>,
    pub structured: Option<Value>,
    pub usage: TokenUsage,
    pub turns: u32,
    pub exit_code: Option<i32>,
    pub termination_reason: Option<String>,
    pub stderr: String,
}

impl InvocationOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Completed,
            output: output.into(),
            result: None,
            structured: None,
            usage: TokenUsage::default(),
            turns: 0,
            exit_code: Some(0),
            termination_reason: None,
            stderr: String::new(),
        }
    }

    /// Result text if reported, otherwise the raw output.
    pub fn final_text(&self) -> &str {
        self.result.as_deref().unwrap_or(&self.output)
    }

    pub fn was_truncated(&self) -> bool {
        self.outcome == Outcome::StopCondition
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    #[error("failed to spawn `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("io error while streaming output: {0}")]
    Io(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    Store(String),
}

impl InvocationError {
    /// Failures of the external process itself.
    pub fn is_invocation_failure(&self) -> bool {
        matches!(
            self,
            InvocationError::Spawn { .. } | InvocationError::NonZeroExit { .. } | InvocationError::Io(_)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, InvocationError::Validation(_))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The innermost call of a pipeline.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, options: InvocationOptions) -> Result<InvocationOutcome, InvocationError>;
}

/// One pipeline stage. Every hook has a pass-through default.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite outbound options before the call.
    fn transform_options(&self, options: InvocationOptions) -> InvocationOptions {
        options
    }

    /// Wrap the rest of the chain with before/after logic.
    async fn wrap(
        &self,
        options: InvocationOptions,
        next: Next<'_>,
    ) -> Result<InvocationOutcome, InvocationError> {
        next.run(options).await
    }

    /// Rewrite one streamed output chunk.
    fn transform_chunk(&self, chunk: String) -> String {
        chunk
    }

    /// Rewrite the final result.
    fn transform_result(
        &self,
        outcome: InvocationOutcome,
    ) -> Result<InvocationOutcome, InvocationError> {
        Ok(outcome)
    }
}

/// The remainder of the chain, handed to [`Middleware::wrap`].
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    base: &'a dyn Invoke,
}

impl<'a> Next<'a> {
    pub async fn run(self, options: InvocationOptions) -> Result<InvocationOutcome, InvocationError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let options = stage.transform_options(options);
                let next = Next {
                    stages: rest,
                    base: self.base,
                };
                let outcome = stage.wrap(options, next).await?;
                stage.transform_result(outcome)
            }
            None => self.base.invoke(options).await,
        }
    }
}

/// Chunk hooks of every stage, applied in declaration order.
#[derive(Clone, Default)]
pub struct ChunkTransform {
    stages: Vec<Arc<dyn Middleware>>,
}

impl ChunkTransform {
    pub fn apply(&self, chunk: String) -> String {
        self.stages
            .iter()
            .fold(chunk, |chunk, stage| stage.transform_chunk(chunk))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    base: Arc<dyn Invoke>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn execute(
        &self,
        mut options: InvocationOptions,
    ) -> Result<InvocationOutcome, InvocationError> {
        options.chunk_transform = ChunkTransform {
            stages: self.stages.clone(),
        };
        if options.attempt == 0 {
            options.attempt = 1;
        }
        Next {
            stages: &self.stages,
            base: self.base.as_ref(),
        }
        .run(options)
        .await
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    provider: Vec<Arc<dyn Middleware>>,
    node: Vec<Arc<dyn Middleware>>,
    retry: Option<RetryStage>,
    validation: Option<ValidationStage>,
}

impl PipelineBuilder {
    pub fn provider_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.provider.push(stage);
        self
    }

    pub fn provider_stages(mut self, stages: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.provider.extend(stages);
        self
    }

    pub fn node_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.node.push(stage);
        self
    }

    pub fn node_stages(mut self, stages: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.node.extend(stages);
        self
    }

    pub fn retry(mut self, retry: RetryStage) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn validation(mut self, validation: ValidationStage) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn build(self, base: Arc<dyn Invoke>) -> Pipeline {
        let mut stages = self.provider;
        stages.extend(self.node);
        if let Some(retry) = self.retry {
            stages.push(Arc::new(retry));
        }
        if let Some(validation) = self.validation {
            stages.push(Arc::new(validation));
        }
        Pipeline { stages, base }
    }
}

// ---------------------------------------------------------------------------
// RetryStage
// ---------------------------------------------------------------------------

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Passed to the progress callback between attempts.
#[derive(Debug, Clone)]
pub struct RetryProgress {
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: InvocationError,
}

type RetryPredicate = dyn Fn(&InvocationError) -> bool + Send + Sync;
type RetryCallback = dyn Fn(&RetryProgress) + Send + Sync;

#[derive(Clone)]
pub struct RetryStage {
    policy: RetryPolicy,
    predicate: Arc<RetryPredicate>,
    on_retry: Option<Arc<RetryCallback>>,
}

impl RetryStage {
    /// Retries invocation failures only.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            predicate: Arc::new(|e: &InvocationError| e.is_invocation_failure()),
            on_retry: None,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        let policy = RetryPolicy {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        };
        let retry_on = cfg.retry_on;
        let retry_validation = cfg.retry_validation;
        Self::new(policy).with_predicate(move |e| {
            if matches!(e, InvocationError::Cancelled) {
                return false;
            }
            if e.is_validation() {
                return retry_validation;
            }
            match retry_on {
                RetryOn::All => true,
                RetryOn::Invocation => e.is_invocation_failure(),
                RetryOn::None => false,
            }
        })
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&InvocationError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RetryProgress) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Middleware for RetryStage {
    fn name(&self) -> &str {
        "retry"
    }

    async fn wrap(
        &self,
        options: InvocationOptions,
        next: Next<'_>,
    ) -> Result<InvocationOutcome, InvocationError> {
        let mut retries = 0u32;
        loop {
            let mut attempt_options = options.clone();
            attempt_options.attempt = retries + 1;
            match next.run(attempt_options).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    if retries >= self.policy.max_retries || !(self.predicate)(&error) {
                        return Err(error);
                    }
                    let delay = self.policy.delay_for(retries);
                    warn!(
                        node = %options.node_path,
                        attempt = retries + 1,
                        max_retries = self.policy.max_retries,
                        ?delay,
                        %error,
                        "invocation failed, retrying"
                    );
                    if let Some(callback) = &self.on_retry {
                        callback(&RetryProgress {
                            attempt: retries + 1,
                            max_retries: self.policy.max_retries,
                            delay,
                            error,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationStage
// ---------------------------------------------------------------------------

type Validator = dyn Fn(&InvocationOutcome) -> Result<(), String> + Send + Sync;

/// Caller-supplied check on completed results. Truncated results are not
/// validated.
#[derive(Clone)]
pub struct ValidationStage {
    validator: Arc<Validator>,
}

impl ValidationStage {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&InvocationOutcome) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }
}

#[async_trait]
impl Middleware for ValidationStage {
    fn name(&self) -> &str {
        "validation"
    }

    async fn wrap(
        &self,
        options: InvocationOptions,
        next: Next<'_>,
    ) -> Result<InvocationOutcome, InvocationError> {
        let outcome = next.run(options).await?;
        if outcome.outcome == Outcome::Completed {
            if let Err(reason) = (self.validator)(&outcome) {
                debug!(%reason, "result rejected by validator");
                return Err(InvocationError::Validation(reason));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn config_predicate_respects_retry_on() {
        let mut cfg = RetryConfig::default();
        let stage = RetryStage::from_config(&cfg);
        let exit = InvocationError::NonZeroExit {
            code: 1,
            stderr: String::new(),
        };
        assert!((stage.predicate)(&exit));
        assert!(!(stage.predicate)(&InvocationError::Validation("bad".into())));
        assert!(!(stage.predicate)(&InvocationError::Cancelled));

        cfg.retry_validation = true;
        cfg.retry_on = RetryOn::None;
        let stage = RetryStage::from_config(&cfg);
        assert!(!(stage.predicate)(&exit));
        assert!((stage.predicate)(&InvocationError::Validation("bad".into())));
    }
}
