//! Usage governor: token/cost ceilings over a usage window, with a
//! pause-and-resume wait primitive and edge-triggered threshold warnings.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sm_core::config::{BudgetConfig, BudgetWindow, InvocationConfig};
use sm_core::record::TokenUsage;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BudgetError {
    #[error("budget exceeded: {reason}")]
    Exceeded { reason: String },

    #[error("timed out waiting for budget")]
    WaitTimeout,
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Per-million-token prices used when the agent does not report a cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl Pricing {
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }
}

impl From<&InvocationConfig> for Pricing {
    fn from(cfg: &InvocationConfig) -> Self {
        Self {
            input_cost_per_1m: cfg.input_cost_per_1m,
            output_cost_per_1m: cfg.output_cost_per_1m,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits / config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl BudgetLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn total_tokens(max: u64) -> Self {
        Self {
            max_total_tokens: Some(max),
            ..Self::default()
        }
    }

    pub fn cost(max_usd: f64) -> Self {
        Self {
            max_cost_usd: Some(max_usd),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub limits: BudgetLimits,
    pub window: BudgetWindow,
    /// Block in [`UsageGovernor::admit`] instead of failing.
    pub wait_for_budget: bool,
    /// `None` waits until budget frees up.
    pub wait_timeout: Option<Duration>,
    pub warn_ratio: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            limits: BudgetLimits::unlimited(),
            window: BudgetWindow::AllTime,
            wait_for_budget: false,
            wait_timeout: None,
            warn_ratio: 0.8,
        }
    }
}

impl From<&BudgetConfig> for GovernorConfig {
    fn from(cfg: &BudgetConfig) -> Self {
        Self {
            limits: BudgetLimits {
                max_input_tokens: cfg.max_input_tokens,
                max_output_tokens: cfg.max_output_tokens,
                max_total_tokens: cfg.max_total_tokens,
                max_cost_usd: cfg.max_cost_usd,
            },
            window: cfg.window,
            wait_for_budget: cfg.wait_for_budget,
            wait_timeout: None,
            warn_ratio: cfg.warn_ratio,
        }
    }
}

// ---------------------------------------------------------------------------
// UsageWindow
// ---------------------------------------------------------------------------

/// Running totals since the window started (or was last reset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub window: BudgetWindow,
    pub started_at: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
    pub requests: u64,
}

impl UsageWindow {
    fn new(window: BudgetWindow) -> Self {
        Self {
            window,
            started_at: Utc::now(),
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            cost_usd: 0.0,
            requests: 0,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Nominal length of the window. `None` for all-time.
    pub fn period(&self) -> Option<chrono::Duration> {
        match self.window {
            BudgetWindow::Hour => Some(chrono::Duration::hours(1)),
            BudgetWindow::Day => Some(chrono::Duration::days(1)),
            BudgetWindow::Week => Some(chrono::Duration::weeks(1)),
            BudgetWindow::Month => Some(chrono::Duration::days(30)),
            BudgetWindow::AllTime => None,
        }
    }

    /// Whether the window's period has elapsed. Totals are only cleared by
    /// an explicit [`UsageGovernor::reset`].
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.period()
            .map(|p| now - self.started_at >= p)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Check / warnings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    InputTokens,
    OutputTokens,
    TotalTokens,
    CostUsd,
}

impl BudgetDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::InputTokens => "input_tokens",
            BudgetDimension::OutputTokens => "output_tokens",
            BudgetDimension::TotalTokens => "total_tokens",
            BudgetDimension::CostUsd => "cost_usd",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetWarning {
    pub dimension: BudgetDimension,
    pub used: f64,
    pub limit: f64,
    pub ratio: f64,
}

/// `(dimension, used, limit)` for every configured ceiling.
fn dimensions(usage: &UsageWindow, limits: &BudgetLimits) -> Vec<(BudgetDimension, f64, f64)> {
    let mut out = Vec::with_capacity(4);
    if let Some(max) = limits.max_input_tokens {
        out.push((BudgetDimension::InputTokens, usage.input_tokens as f64, max as f64));
    }
    if let Some(max) = limits.max_output_tokens {
        out.push((BudgetDimension::OutputTokens, usage.output_tokens as f64, max as f64));
    }
    if let Some(max) = limits.max_total_tokens {
        out.push((BudgetDimension::TotalTokens, usage.total_tokens() as f64, max as f64));
    }
    if let Some(max) = limits.max_cost_usd {
        out.push((BudgetDimension::CostUsd, usage.cost_usd, max));
    }
    out
}

// ---------------------------------------------------------------------------
// UsageGovernor
// ---------------------------------------------------------------------------

struct GovernorState {
    limits: BudgetLimits,
    usage: UsageWindow,
    /// Dimensions currently above the warning threshold.
    warned: HashSet<BudgetDimension>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl GovernorState {
    fn check(&self) -> BudgetCheck {
        for (dimension, used, limit) in dimensions(&self.usage, &self.limits) {
            if used >= limit {
                return BudgetCheck {
                    allowed: false,
                    reason: Some(format!(
                        "{} budget reached ({used} of {limit})",
                        dimension.as_str()
                    )),
                };
            }
        }
        BudgetCheck {
            allowed: true,
            reason: None,
        }
    }

    /// Re-arm or fire threshold warnings against the current totals.
    fn update_warnings(&mut self, warn_ratio: f64) -> Vec<BudgetWarning> {
        let mut fired = Vec::new();
        for (dimension, used, limit) in dimensions(&self.usage, &self.limits) {
            let ratio = if limit > 0.0 { used / limit } else { 1.0 };
            if ratio >= warn_ratio {
                if self.warned.insert(dimension) {
                    fired.push(BudgetWarning {
                        dimension,
                        used,
                        limit,
                        ratio,
                    });
                }
            } else {
                self.warned.remove(&dimension);
            }
        }
        fired
    }

    /// Wake every registered waiter if budget is available again.
    fn wake_if_available(&mut self) {
        if self.check().allowed && !self.waiters.is_empty() {
            info!(waiters = self.waiters.len(), "budget available, resuming waiters");
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Tracks usage and gates invocations against the budget. One governor is
/// shared by every run of an engine.
///
/// The ceiling is soft: `admit` checks usage already reported, and usage is
/// only folded in once an invocation finishes. Invocations admitted while
/// others are in flight can overshoot a limit by at most the usage of those
/// in-flight invocations.
pub struct UsageGovernor {
    config: GovernorConfig,
    pricing: Pricing,
    state: Mutex<GovernorState>,
    warnings: broadcast::Sender<BudgetWarning>,
}

impl UsageGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let (warnings, _) = broadcast::channel(64);
        let state = GovernorState {
            limits: config.limits,
            usage: UsageWindow::new(config.window),
            warned: HashSet::new(),
            waiters: Vec::new(),
        };
        Self {
            config,
            pricing: Pricing::default(),
            state: Mutex::new(state),
            warnings,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub async fn check_budget(&self) -> BudgetCheck {
        self.state.lock().await.check()
    }

    /// Suspend until budget is available. Each waiter is woken exactly once.
    pub async fn wait_for_budget(&self) -> Result<(), BudgetError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.check().allowed {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        info!("waiting for budget");

        let woken = match self.config.wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| BudgetError::WaitTimeout)?,
            None => rx.await,
        };
        // A dropped sender means the governor itself is gone.
        woken.map_err(|_| BudgetError::WaitTimeout)
    }

    /// Gate one invocation: pass, wait, or fail according to the policy.
    /// Nothing is reserved; see the soft-ceiling note on [`UsageGovernor`].
    pub async fn admit(&self) -> Result<(), BudgetError> {
        let check = self.check_budget().await;
        if check.allowed {
            return Ok(());
        }
        if self.config.wait_for_budget {
            return self.wait_for_budget().await;
        }
        let reason = check.reason.unwrap_or_else(|| "budget exceeded".into());
        warn!(%reason, "invocation rejected by budget");
        Err(BudgetError::Exceeded { reason })
    }

    /// Fold one invocation's usage into the window. When the usage carries
    /// no cost, it is priced from the configured per-token rates.
    pub async fn report_usage(&self, usage: &TokenUsage) -> UsageWindow {
        let cost = if usage.cost_usd > 0.0 {
            usage.cost_usd
        } else {
            self.pricing
                .calculate_cost(usage.input_tokens, usage.output_tokens)
        };

        let (snapshot, fired) = {
            let mut state = self.state.lock().await;
            state.usage.input_tokens += usage.input_tokens;
            state.usage.output_tokens += usage.output_tokens;
            state.usage.cache_read_tokens += usage.cache_read_tokens;
            state.usage.cache_write_tokens += usage.cache_write_tokens;
            state.usage.cost_usd += cost;
            state.usage.requests += 1;
            let fired = state.update_warnings(self.config.warn_ratio);
            (state.usage.clone(), fired)
        };

        for warning in fired {
            warn!(
                dimension = warning.dimension.as_str(),
                used = warning.used,
                limit = warning.limit,
                "usage crossed warning threshold"
            );
            let _ = self.warnings.send(warning);
        }
        snapshot
    }

    /// Zero the window, re-arm warnings and wake waiters.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.usage = UsageWindow::new(self.config.window);
        state.warned.clear();
        state.wake_if_available();
        info!("usage window reset");
    }

    /// Replace the ceilings. Waiters resume if the new limits leave room.
    pub async fn set_limits(&self, limits: BudgetLimits) {
        let mut state = self.state.lock().await;
        state.limits = limits;
        let fired = state.update_warnings(self.config.warn_ratio);
        state.wake_if_available();
        drop(state);
        for warning in fired {
            let _ = self.warnings.send(warning);
        }
    }

    pub async fn usage(&self) -> UsageWindow {
        self.state.lock().await.usage.clone()
    }

    pub async fn limits(&self) -> BudgetLimits {
        self.state.lock().await.limits
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<BudgetWarning> {
        self.warnings.subscribe()
    }
}

impl Default for UsageGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl std::fmt::Debug for UsageGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageGovernor")
            .field("config", &self.config)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}
