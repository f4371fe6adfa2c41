use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Transitions are monotonic: pending -> running -> {completed | failed}.
    pub fn can_transition_to(&self, target: &ExecutionStatus) -> bool {
        matches!(
            (self, target),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a completed invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The process ran to completion.
    Completed,
    /// A stop condition (or the deadline) cut the invocation short.
    StopCondition,
    /// The run's stop flag was set, nothing was spawned.
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::StopCondition => "stop_condition",
            Outcome::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(Outcome::Completed),
            "stop_condition" => Some(Outcome::StopCondition),
            "skipped" => Some(Outcome::Skipped),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("invalid transition for record {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token and cost accounting for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Persisted status and result of one invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub run_id: String,
    pub node_path: String,
    pub node_key: Option<String>,
    pub node_kind: String,
    pub status: ExecutionStatus,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub result_structured: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Stop-condition message when `outcome` is `StopCondition`.
    pub termination_reason: Option<String>,
    pub usage: TokenUsage,
    pub turns: u32,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn new(
        run_id: impl Into<String>,
        node_path: impl Into<String>,
        node_key: Option<String>,
        node_kind: impl Into<String>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), run_id, node_path, node_key, node_kind)
    }

    /// Create a record whose id was chosen ahead of time (the dispatcher
    /// links the id to the node before the runner persists the row).
    pub fn with_id(
        id: impl Into<String>,
        run_id: impl Into<String>,
        node_path: impl Into<String>,
        node_key: Option<String>,
        node_kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            node_path: node_path.into(),
            node_key,
            node_kind: node_kind.into(),
            status: ExecutionStatus::Pending,
            outcome: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            result_structured: None,
            error: None,
            termination_reason: None,
            usage: TokenUsage::default(),
            turns: 0,
            attempts: 0,
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Move to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), RecordError> {
        if !self.status.can_transition_to(&next) {
            return Err(RecordError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            ExecutionStatus::Running => self.started_at = Some(now),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                self.finished_at = Some(now);
                if let Some(started) = self.started_at {
                    self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
                }
            }
            ExecutionStatus::Pending => {}
        }
        tracing::debug!(record = %self.id, from = %self.status, to = %next, "record transition");
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn was_truncated(&self) -> bool {
        self.outcome == Some(Outcome::StopCondition)
    }
}
