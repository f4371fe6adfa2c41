//! Persisted iteration state of `while` nodes.
//!
//! A loop's counter lives in the state store under `loop:{run_id}:{key}`, so
//! a restarted run resumes from the iteration it had reached. The reconciler
//! scopes the loop body's paths by iteration (`root/retry:while@2/...`),
//! which gives every iteration fresh records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Iteration cap for loops that do not set `max_iterations`.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// Store key prefix of loop state.
pub const LOOP_KEY_PREFIX: &str = "loop:";

pub fn loop_key(run_id: &str, key: &str) -> String {
    format!("{LOOP_KEY_PREFIX}{run_id}:{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    /// The condition turned false.
    Completed,
    MaxReached,
}

impl LoopStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, LoopStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration: u64,
    pub max_iterations: u64,
    pub status: LoopStatus,
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    pub fn new(iteration: u64, max_iterations: u64, status: LoopStatus) -> Self {
        Self {
            iteration,
            max_iterations,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Decode a stored value. Anything malformed reads as absent.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Same position and status, ignoring the timestamp.
    pub fn same_progress(&self, other: &LoopState) -> bool {
        self.iteration == other.iteration && self.status == other.status
    }
}
