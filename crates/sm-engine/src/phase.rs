use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Evaluating,
    AwaitingInvocations,
    Terminating,
    Terminated,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunPhase::Idle => "Idle",
            RunPhase::Evaluating => "Evaluating",
            RunPhase::AwaitingInvocations => "AwaitingInvocations",
            RunPhase::Terminating => "Terminating",
            RunPhase::Terminated => "Terminated",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// PhaseEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    Start,
    PassEvaluated,
    Notified,
    Terminate,
    Drained,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhaseEvent::Start => "Start",
            PhaseEvent::PassEvaluated => "PassEvaluated",
            PhaseEvent::Notified => "Notified",
            PhaseEvent::Terminate => "Terminate",
            PhaseEvent::Drained => "Drained",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TerminationReason
// ---------------------------------------------------------------------------

/// Why a run stopped evaluating passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// A `stop` node was present in the tree.
    StopMarker { reason: Option<String> },
    MaxPasses { passes: u64 },
    /// A pass found nothing eligible and nothing in flight.
    FixedPoint,
    Cancelled { reason: String },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::StopMarker { reason: Some(r) } => write!(f, "stop marker: {r}"),
            TerminationReason::StopMarker { reason: None } => write!(f, "stop marker"),
            TerminationReason::MaxPasses { passes } => write!(f, "max passes reached ({passes})"),
            TerminationReason::FixedPoint => write!(f, "fixed point"),
            TerminationReason::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    #[error("invalid transition: cannot apply {event} in phase {phase}")]
    InvalidTransition { phase: RunPhase, event: PhaseEvent },
}

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

/// Replay-loop phases of one run.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunPhase,
    history: Vec<(RunPhase, PhaseEvent, RunPhase)>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunPhase::Idle,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.current
    }

    pub fn history(&self) -> &[(RunPhase, PhaseEvent, RunPhase)] {
        &self.history
    }

    /// Valid transitions:
    /// - Idle                + Start         -> Evaluating
    /// - Evaluating          + PassEvaluated -> AwaitingInvocations
    /// - AwaitingInvocations + Notified      -> Evaluating
    /// - Idle | Evaluating | AwaitingInvocations + Terminate -> Terminating
    /// - Terminating         + Drained       -> Terminated
    pub fn transition(&mut self, event: PhaseEvent) -> Result<RunPhase, PhaseError> {
        let next = match (self.current, event) {
            (RunPhase::Idle, PhaseEvent::Start) => RunPhase::Evaluating,
            (RunPhase::Evaluating, PhaseEvent::PassEvaluated) => RunPhase::AwaitingInvocations,
            (RunPhase::AwaitingInvocations, PhaseEvent::Notified) => RunPhase::Evaluating,
            (
                RunPhase::Idle | RunPhase::Evaluating | RunPhase::AwaitingInvocations,
                PhaseEvent::Terminate,
            ) => RunPhase::Terminating,
            (RunPhase::Terminating, PhaseEvent::Drained) => RunPhase::Terminated,
            _ => {
                return Err(PhaseError::InvalidTransition {
                    phase: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "run phase transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: PhaseEvent) -> bool {
        let mut trial = self.clone();
        trial.transition(event).is_ok()
    }

    /// Number of times the machine entered `Evaluating`.
    pub fn passes(&self) -> u64 {
        self.history
            .iter()
            .filter(|(_, _, to)| *to == RunPhase::Evaluating)
            .count() as u64
    }

    pub fn is_terminated(&self) -> bool {
        self.current == RunPhase::Terminated
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
