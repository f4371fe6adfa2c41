use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sm_harness::shutdown::StopSignal;
use uuid::Uuid;

/// Per-run state threaded through the scheduler and every dispatch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    /// Working directory for invocations, unless isolation overrides it.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stop: StopSignal,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_run_id(Uuid::new_v4().to_string())
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            cwd: None,
            env: BTreeMap::new(),
            stop: StopSignal::new(),
            started_at: Utc::now(),
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_stop_requested()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
