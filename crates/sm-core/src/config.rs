use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.smithy/config.toml`.
///
/// Every section is optional; a missing file or section yields defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub invocation: InvocationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load config from `~/.smithy/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.budget.validate()?;
        self.invocation.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".smithy")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_project_name() -> String {
    "smithy".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Requests / input tokens / output tokens per minute. `None` = unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rpm: Option<u64>,
    #[serde(default)]
    pub itpm: Option<u64>,
    #[serde(default)]
    pub otpm: Option<u64>,
    #[serde(default = "default_true")]
    pub queue_when_limited: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: None,
            itpm: None,
            otpm: None,
            queue_when_limited: true,
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_when_limited && self.max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.max_queue_size must be > 0 when queue_when_limited is set".into(),
            ));
        }
        for (name, value) in [("rpm", self.rpm), ("itpm", self.itpm), ("otpm", self.otpm)] {
            if value == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "rate_limit.{name} must be > 0 (omit it for unlimited)"
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_queue_size() -> usize {
    100
}
fn default_queue_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Hour,
    Day,
    Week,
    Month,
    #[default]
    AllTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_input_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub window: BudgetWindow,
    #[serde(default)]
    pub wait_for_budget: bool,
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: None,
            max_output_tokens: None,
            max_total_tokens: None,
            max_cost_usd: None,
            window: BudgetWindow::default(),
            wait_for_budget: false,
            warn_ratio: default_warn_ratio(),
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.warn_ratio > 0.0 && self.warn_ratio <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "budget.warn_ratio must be in (0, 1], got {}",
                self.warn_ratio
            )));
        }
        if let Some(cost) = self.max_cost_usd {
            if cost < 0.0 {
                return Err(ConfigError::Validation(
                    "budget.max_cost_usd must not be negative".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_warn_ratio() -> f64 {
    0.8
}

/// Which errors the retry stage retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    All,
    #[default]
    Invocation,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub retry_on: RetryOn,
    #[serde(default)]
    pub retry_validation: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_on: RetryOn::default(),
            retry_validation: false,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Output tokens reserved from the limiter before the real count is known.
    #[serde(default = "default_output_estimate")]
    pub default_output_estimate: u64,
    #[serde(default)]
    pub input_cost_per_1m: f64,
    #[serde(default)]
    pub output_cost_per_1m: f64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            agent_command: default_agent_command(),
            agent_args: default_agent_args(),
            default_output_estimate: default_output_estimate(),
            input_cost_per_1m: 0.0,
            output_cost_per_1m: 0.0,
        }
    }
}

impl InvocationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "invocation.timeout_ms must be > 0".into(),
            ));
        }
        if self.agent_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "invocation.agent_command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    300_000
}
fn default_agent_command() -> String {
    "claude".into()
}
fn default_agent_args() -> Vec<String> {
    ["-p", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_output_estimate() -> u64 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_passes")]
    pub max_passes: u64,
    #[serde(default)]
    pub min_pass_interval_ms: u64,
    /// How long termination waits for in-flight invocations.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Abort when one pass signature recurs this many more times. 0 disables.
    #[serde(default = "default_storm_repeat_limit")]
    pub storm_repeat_limit: u32,
    /// Abort when more passes than this start within a second. 0 disables.
    #[serde(default = "default_max_passes_per_second")]
    pub max_passes_per_second: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_passes: default_max_passes(),
            min_pass_interval_ms: 0,
            drain_timeout_ms: default_drain_timeout_ms(),
            storm_repeat_limit: default_storm_repeat_limit(),
            max_passes_per_second: default_max_passes_per_second(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_passes == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_passes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_passes() -> u64 {
    1_000
}
fn default_drain_timeout_ms() -> u64 {
    600_000
}
fn default_storm_repeat_limit() -> u32 {
    5
}
fn default_max_passes_per_second() -> u32 {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file. Absent means an in-memory store.
    #[serde(default)]
    pub path: Option<String>,
}
