//! The replay loop.
//!
//! Each pass renders the workflow into the intent tree, persists the plan if
//! it changed, dispatches every eligible node and advances settled loops,
//! then parks until the store reports a change worth re-evaluating for. The
//! loop ends on a stop marker, a fixed point, the pass ceiling, or
//! cancellation. A frame storm aborts it.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sm_core::config::SchedulerConfig;
use sm_core::loops::{loop_key, LoopState, LoopStatus, DEFAULT_MAX_ITERATIONS};
use sm_core::plan::{lint, serialize_plan};
use sm_core::reconcile::{Reconciler, RenderContext, WorkflowSpec};
use sm_core::record::{ExecutionRecord, ExecutionStatus};
use sm_core::store::{ChangeQuery, PlanFrame, StateStore, StoreChange, StoreError, Subscription};
use sm_core::tree::{kinds, NodeId, SpecificationError};
use sm_harness::middleware::InvocationError;
use sm_harness::runner::{InvocationRequest, InvocationRunner};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::approvals::ApprovalGate;
use crate::context::RunContext;
use crate::dispatcher::{Completion, DispatchError, DispatchKey, Dispatcher, Drain, InFlight};
use crate::eligibility::{
    boundary_status, find_eligible, find_stop_marker, has_dispatchable, loop_nodes,
    parallel_boundaries,
};
use crate::events::{EventBus, RunEvent};
use crate::isolation::{IsolationProvider, SharedWorkspace};
use crate::phase::{PhaseEvent, RunPhase, RunStateMachine, TerminationReason};
use crate::storm::{pass_signature, FrameStormGuard};

/// Approval keys resolve through the gate's own record, so their writes do
/// not trigger passes.
const APPROVAL_KEY_PREFIX: &str = "approval:";

/// Error on records whose dispatch outlived the drain timeout.
const DRAIN_ABORT_ERROR: &str = "aborted after drain timeout";

// ---------------------------------------------------------------------------
// Errors and summary
// ---------------------------------------------------------------------------

/// Run-level failure. Aborts the loop and is reported once as `RunAborted`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Specification(#[from] SpecificationError),

    #[error("state store unavailable: {0}")]
    Store(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("frame storm: {0}")]
    FrameStorm(String),
}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        RunError::Store(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub passes: u64,
    pub termination: TerminationReason,
    pub records: Vec<ExecutionRecord>,
    /// Plan XML of the last evaluated tree.
    pub final_plan: String,
}

impl RunSummary {
    /// Latest record at a node path.
    pub fn record_at(&self, path: &str) -> Option<&ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.node_path == path)
            .max_by_key(|r| r.created_at)
    }

    /// Latest record for a node key.
    pub fn record(&self, key: &str) -> Option<&ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.node_key.as_deref() == Some(key))
            .max_by_key(|r| r.created_at)
    }
}

/// Why the loop woke up between passes.
enum Wake {
    /// Record ids seen reaching a terminal status.
    Changed(HashSet<String>),
    Cancelled,
}

enum Signal {
    Change(Option<StoreChange>),
    Completed(Completion),
    Stopped,
}

type InvocationFuture = Pin<Box<dyn Future<Output = Result<ExecutionRecord, InvocationError>> + Send>>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    ctx: RunContext,
    spec: Arc<dyn WorkflowSpec>,
    store: Arc<dyn StateStore>,
    runner: Arc<InvocationRunner>,
    bus: EventBus,
    config: SchedulerConfig,
    isolation: Arc<dyn IsolationProvider>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    phase: RunStateMachine,
    frame_sequence: u64,
    last_plan: Option<String>,
    settled_boundaries: HashSet<String>,
    storm: FrameStormGuard,
}

impl Scheduler {
    pub fn new(
        ctx: RunContext,
        spec: Arc<dyn WorkflowSpec>,
        runner: Arc<InvocationRunner>,
        bus: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        let storm = FrameStormGuard::new(
            config.storm_repeat_limit,
            config.max_passes_per_second,
        );
        Self {
            store: runner.store().clone(),
            ctx,
            spec,
            runner,
            bus,
            config,
            isolation: Arc::new(SharedWorkspace),
            reconciler: Reconciler::new(),
            dispatcher: Dispatcher::new(),
            phase: RunStateMachine::new(),
            frame_sequence: 0,
            last_plan: None,
            settled_boundaries: HashSet::new(),
            storm,
        }
    }

    pub fn with_isolation(mut self, isolation: Arc<dyn IsolationProvider>) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.phase()
    }

    /// Drive the run to `Terminated`.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        let span = info_span!("run", run_id = %self.ctx.run_id);
        async move {
            let mut changes = self.store.subscribe(ChangeQuery::Run {
                run_id: self.ctx.run_id.clone(),
                key_prefix: String::new(),
            });
            self.advance(PhaseEvent::Start);
            self.bus.publish(RunEvent::RunStarted {
                run_id: self.ctx.run_id.clone(),
            });
            info!("run started");

            match self.replay(&mut changes).await {
                Ok(reason) => self.finish(reason).await,
                Err(error) => self.abort(error).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Pass loop. Returns once a termination condition holds.
    async fn replay(&mut self, changes: &mut Subscription) -> Result<TerminationReason, RunError> {
        loop {
            let pass = self.phase.passes();
            let pass_started = Instant::now();
            self.bus.publish(RunEvent::PassStarted {
                run_id: self.ctx.run_id.clone(),
                pass,
            });

            let render_ctx = self.render_context(pass).await?;
            let report = self.reconciler.evaluate(self.spec.as_ref(), &render_ctx)?;
            let plan_changed = self.persist_plan().await?;
            let signature = pass_signature(self.last_plan.as_deref().unwrap_or_default(), &render_ctx);
            self.storm
                .check(signature, pass_started)
                .map_err(|e| RunError::FrameStorm(e.to_string()))?;
            debug!(
                pass,
                generation = report.generation,
                mounted = report.mounted.len(),
                unmounted = report.unmounted.len(),
                plan_changed,
                "pass evaluated"
            );

            if let Some(marker) = find_stop_marker(self.reconciler.tree()) {
                info!(path = %marker.path, reason = ?marker.reason, "stop marker reached");
                return Ok(TerminationReason::StopMarker {
                    reason: marker.reason,
                });
            }
            if let Some(reason) = self.ctx.stop.reason() {
                return Ok(TerminationReason::Cancelled { reason });
            }

            let eligible = find_eligible(
                self.reconciler.tree(),
                &render_ctx,
                &self.dispatcher.in_flight_nodes(),
            );
            let mut dispatched = 0;
            for id in eligible {
                if self.dispatch(id).await? {
                    dispatched += 1;
                }
            }

            self.bus.publish(RunEvent::PassCompleted {
                run_id: self.ctx.run_id.clone(),
                pass,
                dispatched,
                in_flight: self.dispatcher.in_flight(),
                plan_changed,
            });
            self.announce_boundaries(&render_ctx);
            let advanced = self.advance_loops(&render_ctx).await?;

            let woken = has_pending_change(changes);
            if dispatched == 0 && self.dispatcher.in_flight() == 0 && !advanced && !woken {
                info!(pass, "fixed point reached");
                return Ok(TerminationReason::FixedPoint);
            }

            self.advance(PhaseEvent::PassEvaluated);
            let finished = if woken {
                HashSet::new()
            } else {
                match self.wait_for_change(changes).await? {
                    Wake::Changed(finished) => finished,
                    Wake::Cancelled => {
                        let reason = self.ctx.stop.reason().unwrap_or_else(|| "cancelled".into());
                        return Ok(TerminationReason::Cancelled { reason });
                    }
                }
            };
            self.coalesce(changes, pass_started, finished).await?;

            let passes = self.phase.passes();
            if passes >= self.config.max_passes {
                warn!(passes, "pass ceiling reached");
                return Ok(TerminationReason::MaxPasses { passes });
            }
            self.advance(PhaseEvent::Notified);
        }
    }

    async fn render_context(&self, pass: u64) -> Result<RenderContext, RunError> {
        let state = self.store.snapshot().await?;
        let records = self.store.records_for_run(&self.ctx.run_id).await?;
        Ok(RenderContext::new(self.ctx.run_id.clone(), pass, state, records))
    }

    /// Save the plan as a new frame when it differs from the last one.
    async fn persist_plan(&mut self) -> Result<bool, RunError> {
        let xml = serialize_plan(self.reconciler.tree());
        if self.last_plan.as_deref() == Some(xml.as_str()) {
            return Ok(false);
        }
        for warning in lint(self.reconciler.tree()) {
            debug!(rule = %warning.rule, path = %warning.path, "{}", warning.message);
        }
        self.frame_sequence += 1;
        self.store
            .save_frame(&PlanFrame::new(self.ctx.run_id.clone(), self.frame_sequence, xml.clone()))
            .await?;
        self.last_plan = Some(xml);
        Ok(true)
    }

    /// Start one node. Returns `false` when the node could not be resolved
    /// into an invocation; it then gets a failed record instead.
    async fn dispatch(&mut self, id: NodeId) -> Result<bool, RunError> {
        let generation = self.reconciler.generation();
        let record_id = Uuid::new_v4().to_string();
        self.reconciler.tree_mut().attach_record(id, record_id.clone());
        let Some(node) = self.reconciler.tree().get(id) else {
            return Ok(false);
        };
        let node = node.clone();

        let isolation = match self.isolation.isolate(&self.ctx, &node) {
            Ok(isolation) => isolation,
            Err(e) => {
                self.fail_unresolved(&node.path, node.key.clone(), &node.kind, &record_id, e.to_string())
                    .await?;
                return Ok(false);
            }
        };

        let store = self.store.clone();
        let work: InvocationFuture = if node.kind == kinds::APPROVAL {
            let gate = ApprovalGate::for_node(&self.ctx.run_id, &node);
            Box::pin(gate.wait(store, self.ctx.stop.clone()))
        } else {
            let request = match InvocationRequest::for_node(&self.ctx.run_id, &node, self.runner.config()) {
                Ok(request) => request,
                Err(e) => {
                    self.fail_unresolved(&node.path, node.key.clone(), &node.kind, &record_id, e.to_string())
                        .await?;
                    return Ok(false);
                }
            };
            let mut request = request.with_record_id(record_id.clone()).with_env(isolation.env);
            if let Some(cwd) = isolation.cwd {
                request = request.with_cwd(cwd);
            }
            let runner = self.runner.clone();
            Box::pin(async move { runner.run(request).await })
        };

        let key = DispatchKey { node: id, generation };
        match self.dispatcher.dispatch(key, node.path.clone(), record_id.clone(), work) {
            Ok(()) => {}
            Err(DispatchError::AlreadyInFlight { .. }) => return Ok(false),
            Err(e) => return Err(RunError::Dispatch(e.to_string())),
        }
        self.bus.publish(RunEvent::NodeDispatched {
            run_id: self.ctx.run_id.clone(),
            node_path: node.path,
            kind: node.kind,
            record_id,
            generation,
        });
        Ok(true)
    }

    /// Persist a failed record for a node that never reached a process.
    async fn fail_unresolved(
        &self,
        path: &str,
        key: Option<String>,
        kind: &str,
        record_id: &str,
        error: String,
    ) -> Result<(), RunError> {
        warn!(%path, %error, "node could not be dispatched");
        let mut record =
            ExecutionRecord::with_id(record_id, self.ctx.run_id.clone(), path, key, kind);
        self.store.insert_record(&record).await?;
        record.error = Some(error);
        record
            .transition(ExecutionStatus::Running)
            .and_then(|_| record.transition(ExecutionStatus::Failed))
            .map_err(|e| RunError::Store(e.to_string()))?;
        self.store.update_record(&record).await?;
        self.bus.publish(RunEvent::InvocationFinished {
            run_id: self.ctx.run_id.clone(),
            node_path: path.to_string(),
            record_id: record_id.to_string(),
            status: record.status,
            outcome: record.outcome,
        });
        Ok(())
    }

    /// Publish `BoundarySettled` once for every parallel boundary whose
    /// children are all terminal.
    fn announce_boundaries(&mut self, ctx: &RenderContext) {
        let tree = self.reconciler.tree();
        for id in parallel_boundaries(tree) {
            let Some(node) = tree.get(id) else { continue };
            if self.settled_boundaries.contains(&node.path) {
                continue;
            }
            let status = boundary_status(tree, id, ctx);
            if status.is_terminal() {
                self.settled_boundaries.insert(node.path.clone());
                self.bus.publish(RunEvent::BoundarySettled {
                    run_id: self.ctx.run_id.clone(),
                    node_path: node.path.clone(),
                    failed: status == crate::eligibility::BoundaryStatus::Failed,
                });
            }
        }
    }

    /// Persist the next position of every loop whose state moved. The key
    /// write wakes the next pass, which renders the new iteration. Returns
    /// whether anything was written.
    async fn advance_loops(&self, ctx: &RenderContext) -> Result<bool, RunError> {
        let tree = self.reconciler.tree();
        let mut advanced = false;
        for id in loop_nodes(tree) {
            let Some(node) = tree.get(id) else { continue };
            let Some(key) = node.key.as_deref() else { continue };
            let stored = ctx.loop_state(key);
            if stored.as_ref().is_some_and(|s| s.status.is_finished()) {
                continue;
            }
            let max = node
                .attr_u64("max_iterations")
                .unwrap_or(DEFAULT_MAX_ITERATIONS);
            let iteration = stored.as_ref().map_or(0, |s| s.iteration);

            let next = if node.attr_bool("condition") != Some(true) {
                LoopState::new(iteration, max, LoopStatus::Completed)
            } else if iteration >= max {
                LoopState::new(iteration, max, LoopStatus::MaxReached)
            } else if has_dispatchable(tree, id) && boundary_status(tree, id, ctx).is_terminal() {
                if iteration + 1 < max {
                    LoopState::new(iteration + 1, max, LoopStatus::Running)
                } else {
                    LoopState::new(iteration, max, LoopStatus::MaxReached)
                }
            } else {
                continue;
            };
            if stored.as_ref().is_some_and(|s| s.same_progress(&next)) {
                continue;
            }

            info!(
                loop_key = %key,
                iteration = next.iteration,
                status = ?next.status,
                "loop advanced"
            );
            self.store
                .set(&loop_key(&self.ctx.run_id, key), next.to_value())
                .await?;
            self.bus.publish(RunEvent::LoopAdvanced {
                run_id: self.ctx.run_id.clone(),
                node_path: node.path.clone(),
                iteration: next.iteration,
                status: next.status,
            });
            advanced = true;
        }
        Ok(advanced)
    }

    /// Park until something warrants a new pass.
    async fn wait_for_change(&mut self, changes: &mut Subscription) -> Result<Wake, RunError> {
        loop {
            let in_flight = self.dispatcher.in_flight() > 0;
            let signal = tokio::select! {
                change = changes.recv() => Signal::Change(change),
                Some(completion) = self.dispatcher.next_completion(), if in_flight => {
                    Signal::Completed(completion)
                }
                _ = self.ctx.stop.stopped() => Signal::Stopped,
            };
            match signal {
                Signal::Change(None) => return Err(RunError::Store("change feed closed".into())),
                Signal::Change(Some(change)) => {
                    if let Some(record_id) = terminal_record(&change) {
                        return Ok(Wake::Changed(HashSet::from([record_id])));
                    }
                    if triggers_pass(&change) {
                        return Ok(Wake::Changed(HashSet::new()));
                    }
                }
                Signal::Completed(completion) => {
                    self.complete(completion)?;
                    return Ok(Wake::Changed(HashSet::new()));
                }
                Signal::Stopped => return Ok(Wake::Cancelled),
            }
        }
    }

    /// Swallow whatever is already queued so one logical change costs one
    /// pass, honouring the minimum pass interval.
    async fn coalesce(
        &mut self,
        changes: &mut Subscription,
        pass_started: Instant,
        mut finished: HashSet<String>,
    ) -> Result<(), RunError> {
        let interval = Duration::from_millis(self.config.min_pass_interval_ms);
        if !interval.is_zero() {
            tokio::time::sleep_until(pass_started + interval).await;
        }

        while let Some(change) = changes.try_recv() {
            if let Some(record_id) = terminal_record(&change) {
                finished.insert(record_id);
            }
        }
        // A terminal record means its dispatch is about to report; wait for it
        // so the node is not counted as in flight next pass.
        while self
            .dispatcher
            .in_flight_entries()
            .any(|entry| finished.contains(&entry.record_id))
        {
            match self.dispatcher.next_completion().await {
                Some(completion) => self.complete(completion)?,
                None => break,
            }
        }
        while let Some(completion) = self.dispatcher.try_next_completion() {
            self.complete(completion)?;
        }
        Ok(())
    }

    fn complete(&mut self, completion: Completion) -> Result<(), RunError> {
        match completion.result {
            Ok(record) => {
                debug!(path = %completion.path, status = %record.status.as_str(), "invocation finished");
                self.bus.publish(RunEvent::InvocationFinished {
                    run_id: self.ctx.run_id.clone(),
                    node_path: completion.path,
                    record_id: completion.record_id,
                    status: record.status,
                    outcome: record.outcome,
                });
                Ok(())
            }
            Err(DispatchError::Invocation(InvocationError::Store(e))) => Err(RunError::Store(e)),
            Err(e) => Err(RunError::Dispatch(e.to_string())),
        }
    }

    /// Stop dispatching, let in-flight work finish, and summarise.
    async fn finish(mut self, reason: TerminationReason) -> Result<RunSummary, RunError> {
        self.advance(PhaseEvent::Terminate);
        self.ctx.stop.request_stop(reason.to_string());
        let Drain { completed, aborted } = self
            .dispatcher
            .drain(Duration::from_millis(self.config.drain_timeout_ms))
            .await;
        let mut drain_error = None;
        for completion in completed {
            if let Err(e) = self.complete(completion) {
                drain_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.fail_aborted(aborted).await {
            drain_error.get_or_insert(e);
        }
        self.advance(PhaseEvent::Drained);
        if let Some(error) = drain_error {
            self.report_abort(&error);
            return Err(error);
        }

        let records = self.store.records_for_run(&self.ctx.run_id).await?;
        let final_ctx = RenderContext::new(self.ctx.run_id.clone(), self.phase.passes(), Default::default(), records.clone());
        self.announce_boundaries(&final_ctx);

        let passes = self.phase.passes();
        info!(passes, reason = %reason, "run terminated");
        self.bus.publish(RunEvent::RunTerminated {
            run_id: self.ctx.run_id.clone(),
            passes,
            reason: reason.clone(),
        });
        Ok(RunSummary {
            run_id: self.ctx.run_id.clone(),
            passes,
            termination: reason,
            records,
            final_plan: self.last_plan.unwrap_or_default(),
        })
    }

    async fn abort(mut self, error: RunError) -> Result<RunSummary, RunError> {
        warn!(%error, "run aborted");
        self.ctx.stop.request_stop(error.to_string());
        if self.phase.can_transition(PhaseEvent::Terminate) {
            self.advance(PhaseEvent::Terminate);
        }
        let Drain { completed, aborted } = self
            .dispatcher
            .drain(Duration::from_millis(self.config.drain_timeout_ms))
            .await;
        for completion in completed {
            let _ = self.complete(completion);
        }
        if let Err(e) = self.fail_aborted(aborted).await {
            warn!(error = %e, "could not close aborted records");
        }
        self.advance(PhaseEvent::Drained);
        self.report_abort(&error);
        Err(error)
    }

    /// Close the records of dispatches killed at the drain deadline.
    async fn fail_aborted(&self, aborted: Vec<InFlight>) -> Result<(), RunError> {
        for entry in aborted {
            let Some(mut record) = self.store.get_record(&entry.record_id).await? else {
                continue;
            };
            if record.is_terminal() {
                continue;
            }
            record.error = Some(DRAIN_ABORT_ERROR.to_string());
            if record.status == ExecutionStatus::Pending {
                record
                    .transition(ExecutionStatus::Running)
                    .map_err(|e| RunError::Store(e.to_string()))?;
            }
            record
                .transition(ExecutionStatus::Failed)
                .map_err(|e| RunError::Store(e.to_string()))?;
            self.store.update_record(&record).await?;
            warn!(path = %entry.path, record_id = %entry.record_id, "in-flight record failed at drain timeout");
            self.bus.publish(RunEvent::InvocationFinished {
                run_id: self.ctx.run_id.clone(),
                node_path: entry.path,
                record_id: entry.record_id,
                status: record.status,
                outcome: record.outcome,
            });
        }
        Ok(())
    }

    fn report_abort(&self, error: &RunError) {
        self.bus.publish(RunEvent::RunAborted {
            run_id: self.ctx.run_id.clone(),
            error: error.to_string(),
        });
    }

    fn advance(&mut self, event: PhaseEvent) {
        if let Err(e) = self.phase.transition(event) {
            debug!(error = %e, "ignored phase event");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", &self.ctx.run_id)
            .field("phase", &self.phase.phase())
            .field("in_flight", &self.dispatcher.in_flight())
            .finish()
    }
}

/// Record id of a record that reached a terminal status.
fn terminal_record(change: &StoreChange) -> Option<String> {
    match change {
        StoreChange::Record { id, status, .. } if status.is_terminal() => Some(id.clone()),
        _ => None,
    }
}

/// Non-record changes that warrant a pass.
fn triggers_pass(change: &StoreChange) -> bool {
    match change {
        StoreChange::Key { key } => !key.starts_with(APPROVAL_KEY_PREFIX),
        StoreChange::Lagged { .. } => true,
        StoreChange::Record { .. } | StoreChange::Frame { .. } => false,
    }
}

/// Whether a change that warrants a pass is already queued. Consumes
/// everything queued up to and including the first such change.
fn has_pending_change(changes: &mut Subscription) -> bool {
    while let Some(change) = changes.try_recv() {
        if terminal_record(&change).is_some() || triggers_pass(&change) {
            return true;
        }
    }
    false
}
