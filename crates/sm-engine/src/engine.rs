use std::sync::Arc;

use sm_core::config::Config;
use sm_core::reconcile::WorkflowSpec;
use sm_core::sqlite_store::SqliteStore;
use sm_core::store::{MemoryStore, StateStore, StoreError};
use sm_harness::budget::{GovernorConfig, Pricing, UsageGovernor};
use sm_harness::middleware::{Middleware, RetryStage};
use sm_harness::process::ProcessSpawner;
use sm_harness::rate_limiter::{RateLimitConfig, RateLimiter};
use sm_harness::runner::{InvocationRunner, RunnerConfig};
use sm_harness::shutdown::StopSignal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::approvals::{self, ApprovalError};
use crate::context::RunContext;
use crate::events::{EventBus, RunEvent};
use crate::isolation::{IsolationProvider, SharedWorkspace};
use crate::scheduler::{RunError, RunSummary, Scheduler};

/// Entry point: owns the store, the process spawner and the limiter and
/// governor shared by every run it starts.
pub struct Engine {
    store: Arc<dyn StateStore>,
    spawner: Arc<dyn ProcessSpawner>,
    config: Config,
    limiter: Arc<RateLimiter>,
    governor: Arc<UsageGovernor>,
    isolation: Arc<dyn IsolationProvider>,
    provider_stages: Vec<Arc<dyn Middleware>>,
}

impl Engine {
    pub fn new(store: Arc<dyn StateStore>, spawner: Arc<dyn ProcessSpawner>, config: Config) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig::from(&config.rate_limit));
        let governor = UsageGovernor::new(GovernorConfig::from(&config.budget))
            .with_pricing(Pricing::from(&config.invocation));
        Self {
            store,
            spawner,
            config,
            limiter: Arc::new(limiter),
            governor: Arc::new(governor),
            isolation: Arc::new(SharedWorkspace),
            provider_stages: Vec::new(),
        }
    }

    /// Build an engine whose store follows `[store]`: a SQLite file when a
    /// path is configured, memory otherwise.
    pub async fn open(spawner: Arc<dyn ProcessSpawner>, config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn StateStore> = match config.store.path.as_deref() {
            Some(path) => Arc::new(SqliteStore::open(path).await?),
            None => MemoryStore::shared(),
        };
        Ok(Self::new(store, spawner, config))
    }

    pub fn with_isolation(mut self, isolation: Arc<dyn IsolationProvider>) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_governor(mut self, governor: Arc<UsageGovernor>) -> Self {
        self.governor = governor;
        self
    }

    /// Middleware applied to every agent and command invocation.
    pub fn with_provider_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.provider_stages.push(stage);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn governor(&self) -> &Arc<UsageGovernor> {
        &self.governor
    }

    /// Start a run with a fresh context.
    pub fn start(&self, spec: impl WorkflowSpec + 'static) -> RunHandle {
        self.start_with(RunContext::new(), Arc::new(spec))
    }

    /// Start a run in a caller-built context (fixed run id, cwd, env).
    pub fn start_with(&self, ctx: RunContext, spec: Arc<dyn WorkflowSpec>) -> RunHandle {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let run_id = ctx.run_id.clone();
        let stop = ctx.stop.clone();

        let retry_bus = bus.clone();
        let retry_run = run_id.clone();
        let retry = RetryStage::from_config(&self.config.retry).on_retry(move |progress| {
            retry_bus.publish(RunEvent::RetryScheduled {
                run_id: retry_run.clone(),
                attempt: progress.attempt,
                max_retries: progress.max_retries,
                delay_ms: progress.delay.as_millis() as u64,
                error: progress.error.to_string(),
            });
        });

        let mut runner = InvocationRunner::new(self.store.clone(), self.spawner.clone())
            .with_config(RunnerConfig::from(&self.config.invocation))
            .with_limiter(self.limiter.clone())
            .with_governor(self.governor.clone())
            .with_stop_signal(stop.clone())
            .with_retry(retry);
        for stage in &self.provider_stages {
            runner = runner.with_provider_stage(stage.clone());
        }

        let warnings = forward_budget_warnings(&self.governor, bus.clone(), run_id.clone());
        let scheduler = Scheduler::new(
            ctx,
            spec,
            Arc::new(runner),
            bus.clone(),
            self.config.scheduler.clone(),
        )
        .with_isolation(self.isolation.clone());

        info!(%run_id, "starting run");
        let task = tokio::spawn(async move {
            let result = scheduler.run().await;
            warnings.abort();
            result
        });

        RunHandle {
            run_id,
            stop,
            bus,
            events,
            store: self.store.clone(),
            task,
        }
    }

    /// Start a run and wait for it to terminate.
    pub async fn run(&self, spec: impl WorkflowSpec + 'static) -> Result<RunSummary, RunError> {
        self.start(spec).join().await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("limiter", &self.limiter)
            .field("governor", &self.governor)
            .field("provider_stages", &self.provider_stages.len())
            .finish()
    }
}

/// Relay governor warnings onto one run's bus. The governor is engine-wide,
/// so every live run relays every warning.
fn forward_budget_warnings(governor: &UsageGovernor, bus: EventBus, run_id: String) -> JoinHandle<()> {
    let mut warnings = governor.subscribe_warnings();
    tokio::spawn(async move {
        loop {
            match warnings.recv().await {
                Ok(warning) => bus.publish(RunEvent::BudgetWarning {
                    run_id: run_id.clone(),
                    dimension: warning.dimension.as_str().to_string(),
                    used: warning.used,
                    limit: warning.limit,
                }),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "budget warnings dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A started run.
pub struct RunHandle {
    run_id: String,
    stop: StopSignal,
    bus: EventBus,
    events: flume::Receiver<RunEvent>,
    store: Arc<dyn StateStore>,
    task: JoinHandle<Result<RunSummary, RunError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Block new dispatches. In-flight work finishes under its own timeout
    /// and stop conditions.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.stop.request_stop(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Every event since the run started. Clones share one queue.
    pub fn events(&self) -> flume::Receiver<RunEvent> {
        self.events.clone()
    }

    /// Independent receiver for events published from now on.
    pub fn subscribe(&self) -> flume::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    /// Answer one of this run's approval gates.
    pub async fn respond(
        &self,
        key: &str,
        approved: bool,
        comment: Option<String>,
    ) -> Result<(), ApprovalError> {
        approvals::respond(self.store.as_ref(), &self.run_id, key, approved, comment).await
    }

    pub async fn join(self) -> Result<RunSummary, RunError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RunError::Dispatch(format!("run task failed: {e}"))),
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
