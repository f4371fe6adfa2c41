//! Engine: the replay loop that turns a workflow specification into
//! dispatched invocations.
//!
//! A run renders its intent tree, dispatches every eligible node through the
//! harness, and re-renders whenever the store reports that something finished,
//! until the tree asks to stop or nothing is left to do.

pub mod approvals;
pub mod context;
pub mod dispatcher;
pub mod eligibility;
pub mod engine;
pub mod events;
pub mod isolation;
pub mod phase;
pub mod scheduler;
pub mod storm;

pub use context::RunContext;
pub use engine::{Engine, RunHandle};
pub use events::{EventBus, RunEvent};
pub use phase::{RunPhase, TerminationReason};
pub use scheduler::{RunError, RunSummary, Scheduler};
