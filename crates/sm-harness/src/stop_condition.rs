//! Predicates that end an invocation early with a truncated (not failed)
//! outcome. Evaluated after every output chunk, first match wins.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Running snapshot of an invocation, updated as output streams in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResult {
    /// Accumulated output text.
    pub output: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u32,
    pub elapsed: Duration,
}

impl PartialResult {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

type Predicate = dyn Fn(&PartialResult) -> bool + Send + Sync;

#[derive(Clone)]
pub enum StopCondition {
    /// Cumulative input + output tokens reached the limit.
    TokenLimit(u64),
    TimeLimit(Duration),
    TurnLimit(u32),
    /// Regex matched anywhere in the accumulated output.
    Pattern {
        regex: Regex,
        message: Option<String>,
    },
    Custom {
        name: String,
        predicate: Arc<Predicate>,
    },
}

impl StopCondition {
    pub fn pattern(pattern: &str) -> Result<Self, StopConditionError> {
        let regex = Regex::new(pattern).map_err(|e| StopConditionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(StopCondition::Pattern {
            regex,
            message: None,
        })
    }

    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&PartialResult) -> bool + Send + Sync + 'static,
    {
        StopCondition::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StopCondition::TokenLimit(_) => "token_limit",
            StopCondition::TimeLimit(_) => "time_limit",
            StopCondition::TurnLimit(_) => "turn_limit",
            StopCondition::Pattern { .. } => "pattern",
            StopCondition::Custom { .. } => "custom",
        }
    }

    /// Returns the termination message when the condition holds.
    pub fn evaluate(&self, partial: &PartialResult) -> Option<String> {
        match self {
            StopCondition::TokenLimit(limit) => (partial.total_tokens() >= *limit).then(|| {
                format!(
                    "Token limit reached ({} >= {limit})",
                    partial.total_tokens()
                )
            }),
            StopCondition::TimeLimit(limit) => (partial.elapsed >= *limit).then(|| {
                format!(
                    "Time limit reached ({}ms >= {}ms)",
                    partial.elapsed.as_millis(),
                    limit.as_millis()
                )
            }),
            StopCondition::TurnLimit(limit) => (partial.turns >= *limit)
                .then(|| format!("Turn limit reached ({} >= {limit})", partial.turns)),
            StopCondition::Pattern { regex, message } => {
                regex.is_match(&partial.output).then(|| {
                    message
                        .clone()
                        .unwrap_or_else(|| format!("Pattern matched: {}", regex.as_str()))
                })
            }
            StopCondition::Custom { name, predicate } => {
                predicate(partial).then(|| format!("Custom condition met: {name}"))
            }
        }
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCondition::TokenLimit(n) => f.debug_tuple("TokenLimit").field(n).finish(),
            StopCondition::TimeLimit(d) => f.debug_tuple("TimeLimit").field(d).finish(),
            StopCondition::TurnLimit(n) => f.debug_tuple("TurnLimit").field(n).finish(),
            StopCondition::Pattern { regex, .. } => {
                f.debug_tuple("Pattern").field(&regex.as_str()).finish()
            }
            StopCondition::Custom { name, .. } => f.debug_tuple("Custom").field(name).finish(),
        }
    }
}

/// The condition that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopTrigger {
    pub index: usize,
    pub kind: &'static str,
    pub message: String,
}

/// Evaluate in declaration order; the first condition that holds wins.
pub fn evaluate_stop_conditions(
    conditions: &[StopCondition],
    partial: &PartialResult,
) -> Option<StopTrigger> {
    conditions.iter().enumerate().find_map(|(index, cond)| {
        cond.evaluate(partial).map(|message| StopTrigger {
            index,
            kind: cond.kind(),
            message,
        })
    })
}

// ---------------------------------------------------------------------------
// Declarative form (node attribute `stop_conditions`)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StopConditionError {
    #[error("invalid stop pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid stop condition: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serializable stop condition, as written in a node's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopConditionSpec {
    TokenLimit { value: u64 },
    TimeLimit { value_ms: u64 },
    TurnLimit { value: u32 },
    Pattern {
        pattern: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl StopConditionSpec {
    pub fn compile(&self) -> Result<StopCondition, StopConditionError> {
        Ok(match self {
            StopConditionSpec::TokenLimit { value } => StopCondition::TokenLimit(*value),
            StopConditionSpec::TimeLimit { value_ms } => {
                StopCondition::TimeLimit(Duration::from_millis(*value_ms))
            }
            StopConditionSpec::TurnLimit { value } => StopCondition::TurnLimit(*value),
            StopConditionSpec::Pattern { pattern, message } => match StopCondition::pattern(pattern)? {
                StopCondition::Pattern { regex, .. } => StopCondition::Pattern {
                    regex,
                    message: message.clone(),
                },
                other => other,
            },
        })
    }
}

/// Compile a JSON array of [`StopConditionSpec`]s.
pub fn compile_stop_conditions(
    value: &serde_json::Value,
) -> Result<Vec<StopCondition>, StopConditionError> {
    let specs: Vec<StopConditionSpec> = serde_json::from_value(value.clone())?;
    specs.iter().map(StopConditionSpec::compile).collect()
}
