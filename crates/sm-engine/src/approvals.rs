//! Human approval gates.
//!
//! Dispatching an `approval` node writes a pending request to the store under
//! `approval:{run_id}:{key}` and parks on a store subscription until someone
//! calls [`respond`]. Approved gates complete; denied or timed-out gates fail.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sm_core::record::{ExecutionRecord, ExecutionStatus, Outcome};
use sm_core::store::{ChangeQuery, StateStore, StoreError};
use sm_core::tree::IntentNode;
use sm_harness::middleware::InvocationError;
use sm_harness::shutdown::StopSignal;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

/// Stored value of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub status: ApprovalStatus,
    pub prompt: String,
    pub node_path: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("approval request already resolved: {0}")]
    AlreadyResolved(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed approval request: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

pub fn approval_key(run_id: &str, key: &str) -> String {
    format!("approval:{run_id}:{key}")
}

/// Read the current state of a gate.
pub async fn pending(store: &dyn StateStore, run_id: &str, key: &str) -> Result<Option<ApprovalRequest>> {
    match store.get(&approval_key(run_id, key)).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Resolve a pending gate. This is the external response surface.
pub async fn respond(
    store: &dyn StateStore,
    run_id: &str,
    key: &str,
    approved: bool,
    comment: Option<String>,
) -> Result<()> {
    let store_key = approval_key(run_id, key);
    let mut request = pending(store, run_id, key)
        .await?
        .ok_or_else(|| ApprovalError::NotFound(store_key.clone()))?;
    if request.status != ApprovalStatus::Pending {
        return Err(ApprovalError::AlreadyResolved(store_key));
    }
    request.status = if approved {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Denied
    };
    request.comment = comment;
    request.resolved_at = Some(Utc::now());
    info!(key = %store_key, approved, "approval resolved");
    store.set(&store_key, serde_json::to_value(&request)?).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

/// One gate dispatch, resolved from an `approval` node.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    pub record_id: String,
    pub run_id: String,
    pub node_path: String,
    pub node_key: String,
    pub prompt: String,
    pub timeout: Option<Duration>,
}

impl ApprovalGate {
    /// Unkeyed approval nodes fall back to their path as the gate key.
    pub fn for_node(run_id: &str, node: &IntentNode) -> Self {
        Self {
            record_id: node
                .record_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            run_id: run_id.to_string(),
            node_path: node.path.clone(),
            node_key: node.key.clone().unwrap_or_else(|| node.path.clone()),
            prompt: node.attr_str("prompt").unwrap_or_default().to_string(),
            timeout: node.attr_u64("timeout_ms").map(Duration::from_millis),
        }
    }

    pub fn store_key(&self) -> String {
        approval_key(&self.run_id, &self.node_key)
    }

    /// Open the gate and wait for a response. The record goes
    /// pending -> running -> completed (approved) or failed (denied, timed out,
    /// run stopped).
    pub async fn wait(
        self,
        store: Arc<dyn StateStore>,
        stop: StopSignal,
    ) -> std::result::Result<ExecutionRecord, InvocationError> {
        let span = info_span!("approval", record_id = %self.record_id, node_path = %self.node_path);
        self.wait_inner(store, stop).instrument(span).await
    }

    async fn wait_inner(
        self,
        store: Arc<dyn StateStore>,
        stop: StopSignal,
    ) -> std::result::Result<ExecutionRecord, InvocationError> {
        let mut record = ExecutionRecord::with_id(
            self.record_id.clone(),
            self.run_id.clone(),
            self.node_path.clone(),
            Some(self.node_key.clone()),
            sm_core::tree::kinds::APPROVAL,
        );
        store.insert_record(&record).await.map_err(store_error)?;
        advance(store.as_ref(), &mut record, ExecutionStatus::Running).await?;

        if stop.is_stop_requested() {
            record.outcome = Some(Outcome::Skipped);
            record.termination_reason = stop.reason();
            advance(store.as_ref(), &mut record, ExecutionStatus::Completed).await?;
            return Ok(record);
        }

        let key = self.store_key();
        let mut changes = store.subscribe(ChangeQuery::KeyPrefix(key.clone()));

        // Keep an existing response (a re-dispatched gate), otherwise open one.
        let existing = read(store.as_ref(), &key).await?;
        if existing.is_none() {
            let request = ApprovalRequest {
                status: ApprovalStatus::Pending,
                prompt: self.prompt.clone(),
                node_path: self.node_path.clone(),
                requested_at: Utc::now(),
                comment: None,
                resolved_at: None,
            };
            let value = serde_json::to_value(&request)
                .map_err(|e| InvocationError::Store(e.to_string()))?;
            store.set(&key, value).await.map_err(store_error)?;
            info!(%key, prompt = %self.prompt, "approval requested");
        }

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let verdict = loop {
            if let Some(request) = read(store.as_ref(), &key).await? {
                if request.status != ApprovalStatus::Pending {
                    break Ok(request);
                }
            }
            tokio::select! {
                change = changes.recv() => {
                    if change.is_none() {
                        break Err("store change feed closed".to_string());
                    }
                }
                _ = sleep_until(deadline) => {
                    let waited = self.timeout.unwrap_or_default();
                    break Err(format!("approval timed out after {}ms", waited.as_millis()));
                }
                _ = stop.stopped() => {
                    break Err("run stopped while awaiting approval".to_string());
                }
            }
        };

        match verdict {
            Ok(request) if request.status == ApprovalStatus::Approved => {
                record.result = Some(request.comment.clone().unwrap_or_else(|| "approved".into()));
                record.result_structured = serde_json::to_value(&request).ok();
                record.outcome = Some(Outcome::Completed);
                advance(store.as_ref(), &mut record, ExecutionStatus::Completed).await?;
            }
            Ok(request) => {
                record.error = Some(match &request.comment {
                    Some(comment) => format!("approval denied: {comment}"),
                    None => "approval denied".to_string(),
                });
                record.result_structured = serde_json::to_value(&request).ok();
                advance(store.as_ref(), &mut record, ExecutionStatus::Failed).await?;
            }
            Err(reason) => {
                warn!(%reason, "approval gate failed");
                record.error = Some(reason);
                advance(store.as_ref(), &mut record, ExecutionStatus::Failed).await?;
            }
        }
        Ok(record)
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn read(
    store: &dyn StateStore,
    key: &str,
) -> std::result::Result<Option<ApprovalRequest>, InvocationError> {
    match store.get(key).await.map_err(store_error)? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| InvocationError::Store(format!("malformed approval at {key}: {e}"))),
        None => Ok(None),
    }
}

async fn advance(
    store: &dyn StateStore,
    record: &mut ExecutionRecord,
    next: ExecutionStatus,
) -> std::result::Result<(), InvocationError> {
    record
        .transition(next)
        .map_err(|e| InvocationError::Store(e.to_string()))?;
    store.update_record(record).await.map_err(store_error)
}

fn store_error(e: StoreError) -> InvocationError {
    InvocationError::Store(e.to_string())
}
