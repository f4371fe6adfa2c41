use std::sync::Arc;
use std::time::Duration;

use sm_core::config::Config;
use sm_core::element::{elements, Element};
use sm_core::loops::{loop_key, LoopState, LoopStatus};
use sm_core::reconcile::RenderContext;
use sm_core::record::{ExecutionStatus, Outcome};
use sm_core::store::{MemoryStore, StateStore};
use sm_core::tree::SpecificationError;
use sm_engine::isolation::DirectoryPerNode;
use sm_engine::{approvals, Engine, RunError, RunEvent, RunHandle, TerminationReason};
use sm_harness::process::{ScriptedProcess, ScriptedSpawner};
use serde_json::Value;
use tokio::sync::Barrier;

type Spec = Result<Vec<Element>, SpecificationError>;

fn quick_config() -> Config {
    let mut config = Config::default();
    config.retry.max_retries = 0;
    config.scheduler.drain_timeout_ms = 5_000;
    config
}

fn engine(spawner: &Arc<ScriptedSpawner>, config: Config) -> (Engine, Arc<MemoryStore>) {
    let store = MemoryStore::shared();
    let engine = Engine::new(store.clone(), spawner.clone(), config);
    (engine, store)
}

async fn join(handle: RunHandle) -> (Result<sm_engine::RunSummary, RunError>, Vec<RunEvent>) {
    let events = handle.events();
    let result = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("run did not terminate");
    (result, events.drain().collect())
}

fn position(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

// ---------------------------------------------------------------------------
// Fan-out / fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_children_start_together_and_boundary_waits_for_both() {
    // Each child blocks on the same two-party barrier: the run can only make
    // progress if both were spawned before either produced output.
    let gate = Arc::new(Barrier::new(2));
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("alpha", ScriptedProcess::output(["alpha done\n"]).gated(gate.clone()))
            .on(
                "beta",
                ScriptedProcess::output(["beta done\n"])
                    .gated(gate.clone())
                    .with_delay(Duration::from_millis(30)),
            ),
    );
    let (engine, _) = engine(&spawner, quick_config());

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        Ok(vec![
            elements::parallel().key("fan").children([
                elements::claude("alpha").key("a"),
                elements::claude("beta").key("b"),
            ]),
            elements::when(ctx.is_completed("a") && ctx.is_completed("b"))
                .child(elements::stop(Some("both done"))),
        ])
    });
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(
        summary.termination,
        TerminationReason::StopMarker {
            reason: Some("both done".into())
        }
    );
    assert_eq!(spawner.max_concurrent(), 2);

    let last_dispatch = events
        .iter()
        .rposition(|e| matches!(e, RunEvent::NodeDispatched { .. }))
        .unwrap();
    let first_finish = position(&events, |e| matches!(e, RunEvent::InvocationFinished { .. })).unwrap();
    assert!(last_dispatch < first_finish);

    // The boundary settles only after both children finished.
    let settled = position(&events, |e| {
        matches!(e, RunEvent::BoundarySettled { node_path, failed: false, .. } if node_path == "root/fan:parallel")
    })
    .unwrap();
    let finishes: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, RunEvent::InvocationFinished { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(finishes.len(), 2);
    assert!(finishes.iter().all(|i| *i < settled));

    for path in ["root/fan:parallel/a:claude", "root/fan:parallel/b:claude"] {
        assert_eq!(summary.record_at(path).unwrap().status, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn failing_child_does_not_cancel_its_sibling() {
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("false", ScriptedProcess::failing(1, "nope"))
            .on("echo", ScriptedProcess::output(["ok\n"]).with_delay(Duration::from_millis(20))),
    );
    let (engine, _) = engine(&spawner, quick_config());

    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::parallel().key("fan").children([
            elements::command("false", Vec::<String>::new()).key("bad"),
            elements::command("echo", ["ok"]).key("good"),
        ])])
    });
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(summary.record("bad").unwrap().status, ExecutionStatus::Failed);
    assert_eq!(summary.record("good").unwrap().status, ExecutionStatus::Completed);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::BoundarySettled { failed: true, .. }
    )));
}

#[tokio::test]
async fn simultaneous_completions_cost_one_pass() {
    // Both children and the test meet at the barrier, so the two finish
    // together while the scheduler is still inside its pass interval.
    let gate = Arc::new(Barrier::new(3));
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("alpha", ScriptedProcess::output(["alpha\n"]).gated(gate.clone()))
            .on("beta", ScriptedProcess::output(["beta\n"]).gated(gate.clone()))
            .on("echo", ScriptedProcess::output(["next\n"])),
    );
    let mut config = quick_config();
    config.scheduler.min_pass_interval_ms = 300;
    let (engine, _) = engine(&spawner, config);

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        let mut out = vec![elements::parallel().key("fan").children([
            elements::claude("alpha").key("a"),
            elements::claude("beta").key("b"),
        ])];
        if ctx.is_completed("a") && ctx.is_completed("b") {
            out.push(elements::command("echo", ["next"]).key("next"));
        }
        Ok(out)
    });
    let mut waited = 0;
    while spawner.spawn_count() < 2 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += 1;
        assert!(waited < 1_000, "children never spawned");
    }
    gate.wait().await;
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(spawner.spawn_count(), 3);
    let first_finish = position(&events, |e| matches!(e, RunEvent::InvocationFinished { .. })).unwrap();
    let next_dispatch = position(&events, |e| {
        matches!(e, RunEvent::NodeDispatched { node_path, .. } if node_path == "root/next:command")
    })
    .unwrap();
    let passes_between = events[first_finish..next_dispatch]
        .iter()
        .filter(|e| matches!(e, RunEvent::PassStarted { .. }))
        .count();
    assert_eq!(passes_between, 1);
    assert_eq!(summary.passes, 3);
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_marker_lets_in_flight_work_finish() {
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("slow", ScriptedProcess::output(["slow done\n"]).with_delay(Duration::from_millis(100)))
            .on("echo", ScriptedProcess::output(["fast\n"])),
    );
    let (engine, _) = engine(&spawner, quick_config());

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        Ok(vec![
            elements::claude("slow").key("slow"),
            elements::command("echo", ["fast"]).key("fast"),
            elements::when(ctx.is_completed("fast")).child(elements::stop(Some("fast finished"))),
        ])
    });
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(
        summary.termination,
        TerminationReason::StopMarker {
            reason: Some("fast finished".into())
        }
    );
    let slow = summary.record("slow").unwrap();
    assert_eq!(slow.status, ExecutionStatus::Completed);
    assert_eq!(slow.outcome, Some(Outcome::Completed));
    assert_eq!(spawner.spawn_count(), 2);

    // No pass starts after the one that saw the marker.
    let passes = events
        .iter()
        .filter(|e| matches!(e, RunEvent::PassStarted { .. }))
        .count() as u64;
    assert_eq!(passes, summary.passes);
    assert!(matches!(events.last(), Some(RunEvent::RunTerminated { .. })));
}

#[tokio::test]
async fn run_reaches_fixed_point_and_persists_plan() {
    let spawner = Arc::new(ScriptedSpawner::new().on("echo", ScriptedProcess::output(["hi\n"])));
    let (engine, store) = engine(&spawner, quick_config());

    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::step("greet").child(elements::command("echo", ["hi"]).key("hello"))])
    });
    let run_id = handle.run_id().to_string();
    let (result, _) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(summary.passes, 2);
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(summary.record("hello").unwrap().result.as_deref(), Some("hi\n"));

    // The plan did not change on the second pass: one frame only.
    let frame = store.latest_frame(&run_id).await.unwrap().unwrap();
    assert_eq!(frame.sequence, 1);
    assert_eq!(frame.xml, summary.final_plan);
    assert!(frame.xml.contains("<command"));
}

#[tokio::test]
async fn pass_ceiling_stops_a_run_that_never_settles() {
    let spawner = Arc::new(ScriptedSpawner::new().on("echo", ScriptedProcess::output(["tick\n"])));
    let mut config = quick_config();
    config.scheduler.max_passes = 3;
    let (engine, _) = engine(&spawner, config);

    // Every pass mounts a fresh node, so there is always work.
    let (result, _) = join(engine.start(|ctx: &RenderContext| -> Spec {
        Ok(vec![elements::command("echo", [ctx.pass.to_string()]).key(format!("tick-{}", ctx.pass))])
    }))
    .await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::MaxPasses { passes: 3 });
    assert_eq!(spawner.spawn_count(), 3);
}

#[tokio::test]
async fn specification_error_aborts_once() {
    let spawner = Arc::new(ScriptedSpawner::new());
    let (engine, _) = engine(&spawner, quick_config());

    let (result, events) = join(engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![
            elements::claude("one").key("dup"),
            elements::claude("two").key("dup"),
        ])
    }))
    .await;

    assert!(matches!(
        result,
        Err(RunError::Specification(SpecificationError::DuplicateKey { .. }))
    ));
    let aborted = events
        .iter()
        .filter(|e| matches!(e, RunEvent::RunAborted { .. }))
        .count();
    assert_eq!(aborted, 1);
    assert!(!events.iter().any(|e| matches!(e, RunEvent::RunTerminated { .. })));
    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn cancel_blocks_new_dispatches() {
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("first", ScriptedProcess::output(["1\n"]).with_delay(Duration::from_millis(100)))
            .on("second", ScriptedProcess::output(["2\n"])),
    );
    let (engine, _) = engine(&spawner, quick_config());

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        let mut out = vec![elements::command("first", Vec::<String>::new()).key("first")];
        if ctx.is_completed("first") {
            out.push(elements::command("second", Vec::<String>::new()).key("second"));
        }
        Ok(out)
    });
    // Cancel once `first` is actually running.
    let mut waited = 0;
    while spawner.spawn_count() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += 1;
        assert!(waited < 1_000, "first never spawned");
    }
    handle.cancel("user abort");
    let summary = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        summary.termination,
        TerminationReason::Cancelled {
            reason: "user abort".into()
        }
    );
    // In-flight work ran to completion; nothing new started.
    assert_eq!(summary.record("first").unwrap().status, ExecutionStatus::Completed);
    assert!(summary.record("second").is_none());
    assert_eq!(spawner.spawn_count(), 1);
}

#[tokio::test]
async fn drain_timeout_fails_records_still_running() {
    let spawner = Arc::new(
        ScriptedSpawner::new().on("wait", ScriptedProcess::output(Vec::<String>::new()).hanging()),
    );
    let mut config = quick_config();
    config.scheduler.drain_timeout_ms = 50;
    let (engine, _) = engine(&spawner, config);

    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::command("wait", Vec::<String>::new()).key("wait")])
    });
    let mut waited = 0;
    while spawner.spawn_count() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += 1;
        assert!(waited < 1_000, "wait never spawned");
    }
    handle.cancel("shutting down");
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    let record = summary.record("wait").unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("aborted after drain timeout"));
    assert!(summary.records.iter().all(|r| r.is_terminal()));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::InvocationFinished { node_path, status: ExecutionStatus::Failed, .. }
            if node_path == "root/wait:command"
    )));
}

// ---------------------------------------------------------------------------
// Loops and frame storms
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loop_runs_until_max_iterations() {
    let spawner = Arc::new(ScriptedSpawner::new().on("echo", ScriptedProcess::output(["again\n"])));
    let (engine, store) = engine(&spawner, quick_config());

    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::while_loop(true, 3)
            .key("retry")
            .child(elements::command("echo", ["again"]).key("attempt"))])
    });
    let run_id = handle.run_id().to_string();
    let (result, events) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(spawner.spawn_count(), 3);
    for iteration in 0..3 {
        let path = format!("root/retry:while@{iteration}/attempt:command");
        assert_eq!(summary.record_at(&path).unwrap().status, ExecutionStatus::Completed);
    }

    let stored = store.get(&loop_key(&run_id, "retry")).await.unwrap().unwrap();
    let state = LoopState::from_value(&stored).unwrap();
    assert_eq!(state.iteration, 2);
    assert_eq!(state.status, LoopStatus::MaxReached);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::LoopAdvanced { iteration: 2, status: LoopStatus::MaxReached, .. }
    )));
}

#[tokio::test]
async fn loop_stops_when_its_condition_turns_false() {
    let spawner = Arc::new(
        ScriptedSpawner::new()
            .on("check", ScriptedProcess::output(["fail\n"]))
            .on("check", ScriptedProcess::output(["ok\n"])),
    );
    let (engine, store) = engine(&spawner, quick_config());

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        Ok(vec![elements::while_loop(ctx.output("check") != Some("ok\n"), 10)
            .key("until-green")
            .child(elements::command("check", Vec::<String>::new()).key("check"))])
    });
    let run_id = handle.run_id().to_string();
    let (result, _) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(spawner.spawn_count(), 2);
    let stored = store.get(&loop_key(&run_id, "until-green")).await.unwrap().unwrap();
    let state = LoopState::from_value(&stored).unwrap();
    assert_eq!(state.iteration, 1);
    assert_eq!(state.status, LoopStatus::Completed);
}

#[tokio::test]
async fn repeated_pass_signature_aborts_the_run() {
    let spawner = Arc::new(
        ScriptedSpawner::new().on("wait", ScriptedProcess::output(Vec::<String>::new()).hanging()),
    );
    let mut config = quick_config();
    config.scheduler.storm_repeat_limit = 3;
    config.scheduler.drain_timeout_ms = 100;
    let (engine, store) = engine(&spawner, config);

    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::command("wait", Vec::<String>::new()).key("wait")])
    });
    // Rewrites the same value: every pass it wakes looks like the last one.
    let writer = tokio::spawn(async move {
        loop {
            store.set("heartbeat", Value::from(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
    });
    let (result, events) = join(handle).await;
    writer.abort();

    match result {
        Err(RunError::FrameStorm(message)) => assert!(message.contains("repeated"), "{message}"),
        other => panic!("expected a frame storm, got {other:?}"),
    }
    assert_eq!(
        events.iter().filter(|e| matches!(e, RunEvent::RunAborted { .. })).count(),
        1
    );
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::InvocationFinished { status: ExecutionStatus::Failed, .. }
    )));
}

// ---------------------------------------------------------------------------
// Approvals and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_gate_unblocks_dependent_work() {
    let spawner = Arc::new(ScriptedSpawner::new().on("echo", ScriptedProcess::output(["shipped\n"])));
    let (engine, store) = engine(&spawner, quick_config());

    let handle = engine.start(|ctx: &RenderContext| -> Spec {
        let mut out = vec![elements::approval("Deploy to prod?").key("deploy")];
        if ctx.is_completed("deploy") {
            out.push(elements::command("echo", ["ship"]).key("ship"));
        }
        Ok(out)
    });

    let run_id = handle.run_id().to_string();
    let mut waited = 0;
    while approvals::pending(store.as_ref(), &run_id, "deploy")
        .await
        .unwrap()
        .is_none()
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
        assert!(waited < 1_000, "approval request never appeared");
    }
    assert_eq!(spawner.spawn_count(), 0);

    handle.respond("deploy", true, Some("go".into())).await.unwrap();
    let (result, _) = join(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.termination, TerminationReason::FixedPoint);
    assert_eq!(summary.record("deploy").unwrap().result.as_deref(), Some("go"));
    assert_eq!(summary.record("ship").unwrap().status, ExecutionStatus::Completed);
    let stored = store
        .get(&approvals::approval_key(&run_id, "deploy"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["status"], "approved");
}

#[tokio::test]
async fn directory_isolation_gives_each_node_its_own_cwd() {
    let tmp = tempfile::tempdir().unwrap();
    let spawner = Arc::new(ScriptedSpawner::new().fallback(ScriptedProcess::output(["ok\n"])));
    let (engine, _) = engine(&spawner, quick_config());
    let engine = engine.with_isolation(Arc::new(DirectoryPerNode::new(tmp.path())));

    let (result, _) = join(engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::parallel().children([
            elements::command("make", ["a"]).key("a"),
            elements::command("make", ["b"]).key("b"),
        ])])
    }))
    .await;
    result.unwrap();

    let cwds: Vec<_> = spawner.spawned().into_iter().map(|r| r.cwd.unwrap()).collect();
    assert_eq!(cwds.len(), 2);
    assert_ne!(cwds[0], cwds[1]);
    assert!(cwds.iter().all(|c| c.starts_with(tmp.path())));
}

#[tokio::test]
async fn events_for_one_run_share_its_id() {
    let spawner = Arc::new(ScriptedSpawner::new().fallback(ScriptedProcess::output(["ok\n"])));
    let (engine, _) = engine(&spawner, quick_config());
    let handle = engine.start(|_: &RenderContext| -> Spec {
        Ok(vec![elements::command("true", Vec::<String>::new()).key("t")])
    });
    let run_id = handle.run_id().to_string();
    let (result, events) = join(handle).await;
    result.unwrap();

    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(events.iter().all(|e| e.run_id() == run_id));
    assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
}
