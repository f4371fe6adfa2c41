//! Invocation runner: performs one node's external action.
//!
//! Owns the node's [`ExecutionRecord`] for the duration of the dispatch
//! (pending -> running -> completed | failed), pushes the call through the
//! middleware [`Pipeline`], and streams process output through the
//! stop-condition evaluator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sm_core::config::{Config, InvocationConfig, RetryConfig};
use sm_core::record::{ExecutionRecord, ExecutionStatus, Outcome, TokenUsage};
use sm_core::store::StateStore;
use sm_core::tree::{kinds, IntentNode};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budget::{GovernorConfig, Pricing, UsageGovernor};
use crate::middleware::{
    ChunkTransform, InvocationError, InvocationOptions, InvocationOutcome, Invoke, Middleware,
    Pipeline, RetryStage, ValidationStage,
};
use crate::process::{ProcessSpawner, SpawnRequest};
use crate::rate_limiter::{RateLimitConfig, RateLimiter, TokenEstimate};
use crate::shutdown::StopSignal;
use crate::stop_condition::{
    compile_stop_conditions, evaluate_stop_conditions, PartialResult, StopCondition,
};

/// Rough chars-per-token ratio for text without reported usage.
const CHARS_PER_TOKEN: usize = 4;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub timeout: Duration,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub default_output_estimate: u64,
}

impl From<&InvocationConfig> for RunnerConfig {
    fn from(cfg: &InvocationConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            agent_command: cfg.agent_command.clone(),
            agent_args: cfg.agent_args.clone(),
            default_output_estimate: cfg.default_output_estimate,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&InvocationConfig::default())
    }
}

// ---------------------------------------------------------------------------
// InvocationRequest
// ---------------------------------------------------------------------------

/// One dispatch, fully resolved from a node's attributes.
#[derive(Clone)]
pub struct InvocationRequest {
    pub record_id: String,
    pub run_id: String,
    pub node_path: String,
    pub node_key: Option<String>,
    pub node_kind: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub stop_conditions: Vec<StopCondition>,
    pub estimate: TokenEstimate,
    /// Agent calls go through the rate limiter and usage governor; plain
    /// commands do not.
    pub gated: bool,
    pub node_stages: Vec<Arc<dyn Middleware>>,
    pub validation: Option<ValidationStage>,
}

impl InvocationRequest {
    /// A plain command, not tied to a tree node.
    pub fn command<I, S>(run_id: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        Self {
            record_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            node_path: format!("root/{program}:{}", kinds::COMMAND),
            node_key: None,
            node_kind: kinds::COMMAND.to_string(),
            program,
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: RunnerConfig::default().timeout,
            stop_conditions: Vec::new(),
            estimate: TokenEstimate::request(),
            gated: false,
            node_stages: Vec::new(),
            validation: None,
        }
    }

    /// Resolve a runnable node into a request.
    ///
    /// Agent nodes become `agent_command agent_args [--model M] [--max-turns N] prompt`;
    /// command nodes run `program args..`.
    pub fn for_node(
        run_id: &str,
        node: &IntentNode,
        config: &RunnerConfig,
    ) -> Result<Self, InvocationError> {
        let required = |name: &str| {
            node.attr_str(name).map(str::to_string).ok_or_else(|| {
                InvocationError::Validation(format!("{} is missing `{name}`", node.path))
            })
        };

        let (program, args, estimate, gated) = if kinds::is_agent(&node.kind) {
            let prompt = required("prompt")?;
            let mut args = config.agent_args.clone();
            if let Some(model) = node.attr_str("model") {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if let Some(max_turns) = node.attr_u64("max_turns") {
                args.extend(["--max-turns".to_string(), max_turns.to_string()]);
            }
            let estimate = TokenEstimate::new(
                node.attr_u64("estimate_input_tokens")
                    .unwrap_or_else(|| prompt.len().div_ceil(CHARS_PER_TOKEN) as u64),
                node.attr_u64("estimate_output_tokens")
                    .unwrap_or(config.default_output_estimate),
            );
            args.push(prompt);
            (config.agent_command.clone(), args, estimate, true)
        } else if node.kind == kinds::COMMAND {
            let program = required("program")?;
            let args = match node.attr("args") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            (program, args, TokenEstimate::request(), false)
        } else {
            return Err(InvocationError::Validation(format!(
                "node kind `{}` at {} is not runnable",
                node.kind, node.path
            )));
        };

        let stop_conditions = match node.attr("stop_conditions") {
            Some(value) if !value.is_null() => compile_stop_conditions(value)
                .map_err(|e| InvocationError::Validation(format!("{}: {e}", node.path)))?,
            _ => Vec::new(),
        };

        Ok(Self {
            record_id: node
                .record_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            run_id: run_id.to_string(),
            node_path: node.path.clone(),
            node_key: node.key.clone(),
            node_kind: node.kind.clone(),
            program,
            args,
            cwd: None,
            env: BTreeMap::new(),
            timeout: node
                .attr_u64("timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(config.timeout),
            stop_conditions,
            estimate,
            gated,
            node_stages: Vec::new(),
            validation: None,
        })
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = id.into();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    pub fn with_estimate(mut self, estimate: TokenEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn gated(mut self, gated: bool) -> Self {
        self.gated = gated;
        self
    }

    pub fn with_node_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.node_stages.push(stage);
        self
    }

    pub fn with_validation(mut self, validation: ValidationStage) -> Self {
        self.validation = Some(validation);
        self
    }
}

impl std::fmt::Debug for InvocationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationRequest")
            .field("record_id", &self.record_id)
            .field("node_path", &self.node_path)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("gated", &self.gated)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// InvocationRunner
// ---------------------------------------------------------------------------

pub struct InvocationRunner {
    store: Arc<dyn StateStore>,
    spawner: Arc<dyn ProcessSpawner>,
    limiter: Arc<RateLimiter>,
    governor: Arc<UsageGovernor>,
    stop: StopSignal,
    config: RunnerConfig,
    provider_stages: Vec<Arc<dyn Middleware>>,
    retry: RetryStage,
}

impl InvocationRunner {
    /// Unlimited limiter and budget, default retry policy.
    pub fn new(store: Arc<dyn StateStore>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            store,
            spawner,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::unlimited())),
            governor: Arc::new(UsageGovernor::default()),
            stop: StopSignal::new(),
            config: RunnerConfig::default(),
            provider_stages: Vec::new(),
            retry: RetryStage::from_config(&RetryConfig::default()),
        }
    }

    pub fn from_config(
        store: Arc<dyn StateStore>,
        spawner: Arc<dyn ProcessSpawner>,
        config: &Config,
    ) -> Self {
        let governor = UsageGovernor::new(GovernorConfig::from(&config.budget))
            .with_pricing(Pricing::from(&config.invocation));
        Self {
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit))),
            governor: Arc::new(governor),
            config: RunnerConfig::from(&config.invocation),
            retry: RetryStage::from_config(&config.retry),
            ..Self::new(store, spawner)
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_governor(mut self, governor: Arc<UsageGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryStage) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_provider_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.provider_stages.push(stage);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn governor(&self) -> &Arc<UsageGovernor> {
        &self.governor
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one invocation to a terminal record.
    ///
    /// Invocation failures end up on the returned record (`Failed` with the
    /// error text). `Err` means the record itself could not be persisted.
    pub async fn run(&self, request: InvocationRequest) -> Result<ExecutionRecord, InvocationError> {
        let span = info_span!(
            "invocation",
            record_id = %request.record_id,
            node_path = %request.node_path,
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: InvocationRequest) -> Result<ExecutionRecord, InvocationError> {
        let mut record = ExecutionRecord::with_id(
            request.record_id.clone(),
            request.run_id.clone(),
            request.node_path.clone(),
            request.node_key.clone(),
            request.node_kind.clone(),
        );
        self.store.insert_record(&record).await.map_err(store_error)?;
        self.advance(&mut record, ExecutionStatus::Running).await?;

        if self.stop.is_stop_requested() {
            info!("stop requested, invocation skipped");
            record.outcome = Some(Outcome::Skipped);
            record.termination_reason = self.stop.reason();
            self.advance(&mut record, ExecutionStatus::Completed).await?;
            return Ok(record);
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let base = ProcessInvoker {
            spawner: Arc::clone(&self.spawner),
            limiter: Arc::clone(&self.limiter),
            governor: Arc::clone(&self.governor),
            gated: request.gated,
            attempts: Arc::clone(&attempts),
        };
        let mut builder = Pipeline::builder()
            .provider_stages(self.provider_stages.iter().cloned())
            .node_stages(request.node_stages.iter().cloned())
            .retry(self.retry.clone());
        if let Some(validation) = request.validation.clone() {
            builder = builder.validation(validation);
        }
        let pipeline = builder.build(Arc::new(base));

        debug!(program = %request.program, stages = ?pipeline.stage_names(), "dispatching");
        let options = InvocationOptions {
            run_id: request.run_id,
            record_id: request.record_id,
            node_path: request.node_path,
            node_kind: request.node_kind,
            program: request.program,
            args: request.args,
            cwd: request.cwd,
            env: request.env,
            timeout: request.timeout,
            stop_conditions: request.stop_conditions,
            estimate: request.estimate,
            attempt: 0,
            chunk_transform: ChunkTransform::default(),
        };
        let result = pipeline.execute(options).await;
        record.attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                record.result = Some(outcome.final_text().to_string());
                record.outcome = Some(outcome.outcome);
                record.result_structured = outcome.structured;
                record.usage = outcome.usage;
                record.turns = outcome.turns;
                record.exit_code = outcome.exit_code;
                record.termination_reason = outcome.termination_reason;
                self.advance(&mut record, ExecutionStatus::Completed).await?;
                info!(
                    outcome = record.outcome.map(|o| o.as_str()).unwrap_or("completed"),
                    attempts = record.attempts,
                    duration_ms = record.duration_ms,
                    "invocation finished"
                );
            }
            Err(error) => {
                if let InvocationError::NonZeroExit { code, .. } = &error {
                    record.exit_code = Some(*code);
                }
                record.error = Some(error.to_string());
                self.advance(&mut record, ExecutionStatus::Failed).await?;
                warn!(%error, attempts = record.attempts, "invocation failed");
            }
        }
        Ok(record)
    }

    async fn advance(
        &self,
        record: &mut ExecutionRecord,
        next: ExecutionStatus,
    ) -> Result<(), InvocationError> {
        record
            .transition(next)
            .map_err(|e| InvocationError::Store(e.to_string()))?;
        self.store.update_record(record).await.map_err(store_error)
    }
}

fn store_error(e: sm_core::store::StoreError) -> InvocationError {
    InvocationError::Store(e.to_string())
}

impl std::fmt::Debug for InvocationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationRunner")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("governor", &self.governor)
            .field("stop_requested", &self.stop.is_stop_requested())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ProcessInvoker: the pipeline's base call
// ---------------------------------------------------------------------------

struct ProcessInvoker {
    spawner: Arc<dyn ProcessSpawner>,
    limiter: Arc<RateLimiter>,
    governor: Arc<UsageGovernor>,
    gated: bool,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Invoke for ProcessInvoker {
    async fn invoke(&self, options: InvocationOptions) -> Result<InvocationOutcome, InvocationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            self.governor.admit().await?;
            self.limiter.acquire(options.estimate).await?;
        }

        let request = SpawnRequest {
            program: options.program.clone(),
            args: options.args.clone(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        };
        let mut handle =
            self.spawner
                .spawn(&request)
                .await
                .map_err(|e| InvocationError::Spawn {
                    program: options.program.clone(),
                    reason: e.to_string(),
                })?;

        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut parser = StreamParser::default();
        let mut termination: Option<String> = None;
        let mut timed_out = false;
        let mut io_error: Option<String> = None;

        loop {
            match tokio::time::timeout_at(deadline, handle.next_chunk()).await {
                Err(_) => {
                    timed_out = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    io_error = Some(e.to_string());
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    let chunk = options.chunk_transform.apply(chunk);
                    parser.feed(&chunk);
                    let partial = parser.snapshot(started.elapsed());
                    if let Some(trigger) = evaluate_stop_conditions(&options.stop_conditions, partial) {
                        debug!(kind = trigger.kind, message = %trigger.message, "stop condition met");
                        termination = Some(trigger.message);
                        break;
                    }
                }
            }
        }

        let exit_code = if termination.is_some() || timed_out || io_error.is_some() {
            if let Err(e) = handle.kill().await {
                debug!(error = %e, "kill failed, process may have exited");
            }
            let code = handle.wait().await.unwrap_or(-1);
            if timed_out {
                -1
            } else {
                code
            }
        } else {
            match tokio::time::timeout_at(deadline, handle.wait()).await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => {
                    io_error = Some(e.to_string());
                    -1
                }
                Err(_) => {
                    timed_out = true;
                    let _ = handle.kill().await;
                    -1
                }
            }
        };
        if timed_out {
            termination = Some(format!(
                "Timed out after {}ms",
                options.timeout.as_millis()
            ));
        } else if io_error.is_none() {
            parser.finish();
        }
        let stderr = handle.stderr().await;

        // Charge whatever streamed before a failure too.

        let mut usage = parser.usage();
        if self.gated {
            let window = self.governor.report_usage(&usage).await;
            usage.cost_usd = if usage.cost_usd > 0.0 {
                usage.cost_usd
            } else {
                self.governor
                    .pricing()
                    .calculate_cost(usage.input_tokens, usage.output_tokens)
            };
            debug!(window_tokens = window.total_tokens(), "usage reported");
            self.limiter
                .settle(
                    options.estimate,
                    TokenEstimate::new(usage.input_tokens, usage.output_tokens),
                )
                .await;
        }

        if let Some(error) = io_error {
            return Err(InvocationError::Io(error));
        }
        let outcome = match termination {
            Some(reason) => InvocationOutcome {
                outcome: Outcome::StopCondition,
                termination_reason: Some(reason),
                ..parser.into_outcome(usage, exit_code, stderr)
            },
            None if exit_code != 0 => {
                return Err(InvocationError::NonZeroExit {
                    code: exit_code,
                    stderr: stderr.trim().to_string(),
                })
            }
            None => parser.into_outcome(usage, exit_code, stderr),
        };
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// StreamParser: stream-json lines or raw text
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    #[default]
    Start,
    Json,
    Raw,
}

/// Incremental stdout parser.
///
/// Lines starting with `{` are buffered and parsed as stream-json messages on
/// newline; any other text is appended to the output as it arrives so pattern
/// conditions see it immediately.
#[derive(Debug, Default)]
struct StreamParser {
    mode: LineMode,
    pending: String,
    partial: PartialResult,
    result: Option<String>,
    structured: Option<Value>,
    usage: TokenUsage,
    /// A `result` message carried authoritative totals.
    usage_reported: bool,
    raw_chars: usize,
}

impl StreamParser {
    fn feed(&mut self, chunk: &str) {
        let mut rest = chunk;
        while !rest.is_empty() {
            let (line, complete) = match rest.find('\n') {
                Some(i) => (&rest[..=i], true),
                None => (rest, false),
            };
            rest = &rest[line.len()..];

            if self.mode == LineMode::Start {
                self.mode = if line.starts_with('{') {
                    LineMode::Json
                } else {
                    LineMode::Raw
                };
            }
            match self.mode {
                LineMode::Json => {
                    self.pending.push_str(line);
                    if complete {
                        let buffered = std::mem::take(&mut self.pending);
                        self.json_line(&buffered);
                    }
                }
                LineMode::Raw | LineMode::Start => self.raw_text(line),
            }
            if complete {
                self.mode = LineMode::Start;
            }
        }
    }

    /// Flush a trailing line that never got its newline.
    fn finish(&mut self) {
        if !self.pending.is_empty() {
            let buffered = std::mem::take(&mut self.pending);
            self.json_line(&buffered);
        }
        self.mode = LineMode::Start;
    }

    fn raw_text(&mut self, text: &str) {
        self.partial.output.push_str(text);
        self.raw_chars += text.chars().count();
    }

    fn json_line(&mut self, line: &str) {
        match serde_json::from_str::<Value>(line.trim()) {
            Ok(Value::Object(message)) => self.message(&message),
            _ => self.raw_text(line),
        }
    }

    fn message(&mut self, message: &Map<String, Value>) {
        match message.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                self.partial.turns += 1;
                let body = message.get("message");
                if let Some(Value::Array(content)) = body.and_then(|m| m.get("content")) {
                    for block in content {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                self.partial.output.push_str(text);
                            }
                        }
                    }
                }
                if !self.usage_reported {
                    if let Some(usage) = body.and_then(|m| m.get("usage")) {
                        let delta = parse_usage(usage);
                        self.usage.input_tokens += delta.input_tokens;
                        self.usage.output_tokens += delta.output_tokens;
                        self.usage.cache_read_tokens += delta.cache_read_tokens;
                        self.usage.cache_write_tokens += delta.cache_write_tokens;
                    }
                }
            }
            Some("result") => {
                if let Some(text) = message.get("result").and_then(Value::as_str) {
                    self.structured = message
                        .get("structured_output")
                        .cloned()
                        .or_else(|| parse_structured(text));
                    self.result = Some(text.to_string());
                } else if let Some(structured) = message.get("structured_output") {
                    self.structured = Some(structured.clone());
                }
                if let Some(usage) = message.get("usage") {
                    self.usage = parse_usage(usage);
                    self.usage_reported = true;
                }
                if let Some(cost) = message.get("total_cost_usd").and_then(Value::as_f64) {
                    self.usage.cost_usd = cost;
                }
                if let Some(turns) = message.get("num_turns").and_then(Value::as_u64) {
                    self.partial.turns = self.partial.turns.max(turns as u32);
                }
            }
            _ => {}
        }
    }

    /// Reported usage plus an estimate for raw text.
    fn usage(&self) -> TokenUsage {
        let mut usage = self.usage;
        if !self.usage_reported {
            usage.output_tokens += self.raw_chars.div_ceil(CHARS_PER_TOKEN) as u64;
        }
        usage
    }

    fn snapshot(&mut self, elapsed: Duration) -> &PartialResult {
        let usage = self.usage();
        self.partial.input_tokens = usage.input_tokens;
        self.partial.output_tokens = usage.output_tokens;
        self.partial.elapsed = elapsed;
        &self.partial
    }

    fn into_outcome(self, usage: TokenUsage, exit_code: i32, stderr: String) -> InvocationOutcome {
        InvocationOutcome {
            outcome: Outcome::Completed,
            output: self.partial.output,
            result: self.result,
            structured: self.structured,
            usage,
            turns: self.partial.turns,
            exit_code: Some(exit_code),
            termination_reason: None,
            stderr,
        }
    }
}

fn parse_usage(value: &Value) -> TokenUsage {
    let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_write_tokens: field("cache_creation_input_tokens"),
        cost_usd: 0.0,
    }
}

/// Result text that is itself a JSON object or array.
fn parse_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
