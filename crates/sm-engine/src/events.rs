use std::sync::{Arc, Mutex};

use serde::Serialize;
use sm_core::loops::LoopStatus;
use sm_core::record::{ExecutionStatus, Outcome};

use crate::phase::TerminationReason;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// Lifecycle events of one run, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
    },
    PassStarted {
        run_id: String,
        pass: u64,
    },
    PassCompleted {
        run_id: String,
        pass: u64,
        dispatched: usize,
        in_flight: usize,
        plan_changed: bool,
    },
    NodeDispatched {
        run_id: String,
        node_path: String,
        kind: String,
        record_id: String,
        generation: u64,
    },
    InvocationFinished {
        run_id: String,
        node_path: String,
        record_id: String,
        status: ExecutionStatus,
        outcome: Option<Outcome>,
    },
    /// Every child of a parallel boundary reached a terminal status.
    BoundarySettled {
        run_id: String,
        node_path: String,
        failed: bool,
    },
    /// A `while` node moved to a new iteration or finished.
    LoopAdvanced {
        run_id: String,
        node_path: String,
        iteration: u64,
        status: LoopStatus,
    },
    RetryScheduled {
        run_id: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    /// The usage governor is shared by every run of an engine, so this
    /// warning is engine-wide: each live run receives it stamped with its own
    /// `run_id`, whichever run's usage crossed the threshold.
    BudgetWarning {
        run_id: String,
        dimension: String,
        used: f64,
        limit: f64,
    },
    RunTerminated {
        run_id: String,
        passes: u64,
        reason: TerminationReason,
    },
    /// Run-level failure. Published at most once per run.
    RunAborted {
        run_id: String,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id }
            | RunEvent::PassStarted { run_id, .. }
            | RunEvent::PassCompleted { run_id, .. }
            | RunEvent::NodeDispatched { run_id, .. }
            | RunEvent::InvocationFinished { run_id, .. }
            | RunEvent::BoundarySettled { run_id, .. }
            | RunEvent::LoopAdvanced { run_id, .. }
            | RunEvent::RetryScheduled { run_id, .. }
            | RunEvent::BudgetWarning { run_id, .. }
            | RunEvent::RunTerminated { run_id, .. }
            | RunEvent::RunAborted { run_id, .. } => run_id,
        }
    }

    /// `true` for the last event a run publishes.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RunEvent::RunTerminated { .. } | RunEvent::RunAborted { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a new receiver that
/// gets every event published after it subscribed. Clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<RunEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<RunEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.push(tx);
        rx
    }

    /// Disconnected subscribers are pruned on publish.
    pub fn publish(&self, event: RunEvent) {
        tracing::trace!(?event, "run event");
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> RunEvent {
        RunEvent::RunStarted { run_id: id.into() }
    }

    #[test]
    fn every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(started("r1"));
        assert_eq!(a.try_recv().unwrap(), started("r1"));
        assert_eq!(b.try_recv().unwrap(), started("r1"));
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(started("r1"));
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(started("r1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(RunEvent::RunAborted {
            run_id: "r1".into(),
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "run_aborted");
        assert_eq!(json["error"], "boom");
    }
}
