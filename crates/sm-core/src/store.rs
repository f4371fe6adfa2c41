//! Persisted state contract: a key/value space, a row store for
//! [`ExecutionRecord`]s, plan frames, and change notification.
//!
//! The scheduler never polls; it subscribes with a [`ChangeQuery`] and is
//! woken when a matching write lands.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::record::{ExecutionRecord, ExecutionStatus, RecordError};

/// Buffered notifications per subscriber before it is considered lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record already exists: {0}")]
    DuplicateRecord(String),

    #[error(transparent)]
    Transition(#[from] RecordError),
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Serialized plan persisted after a pass that changed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFrame {
    pub run_id: String,
    pub sequence: u64,
    pub xml: String,
    pub created_at: DateTime<Utc>,
}

impl PlanFrame {
    pub fn new(run_id: impl Into<String>, sequence: u64, xml: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            sequence,
            xml: xml.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Change notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Key {
        key: String,
    },
    Record {
        id: String,
        run_id: String,
        status: ExecutionStatus,
    },
    Frame {
        run_id: String,
        sequence: u64,
    },
    /// The subscriber fell behind and missed `missed` notifications.
    Lagged {
        missed: u64,
    },
}

/// Which changes a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeQuery {
    All,
    KeyPrefix(String),
    Records { run_id: String },
    /// Record changes for `run_id` plus key writes under `prefix`.
    Run { run_id: String, key_prefix: String },
}

impl ChangeQuery {
    pub fn matches(&self, change: &StoreChange) -> bool {
        match (self, change) {
            (_, StoreChange::Lagged { .. }) => true,
            (ChangeQuery::All, _) => true,
            (ChangeQuery::KeyPrefix(prefix), StoreChange::Key { key }) => key.starts_with(prefix),
            (ChangeQuery::Records { run_id }, StoreChange::Record { run_id: r, .. }) => r == run_id,
            (ChangeQuery::Run { run_id, .. }, StoreChange::Record { run_id: r, .. }) => r == run_id,
            (ChangeQuery::Run { key_prefix, .. }, StoreChange::Key { key }) => {
                key.starts_with(key_prefix.as_str())
            }
            _ => false,
        }
    }
}

/// Fan-out of store writes to every live [`Subscription`].
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<StoreChange>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self, query: ChangeQuery) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            query,
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Filtered stream of store changes.
pub struct Subscription {
    rx: broadcast::Receiver<StoreChange>,
    query: ChangeQuery,
}

impl Subscription {
    /// Wait for the next matching change. `None` once the store is dropped.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.query.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "store subscriber lagged");
                    return Some(StoreChange::Lagged { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued matching change, without waiting.
    pub fn try_recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.query.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(StoreChange::Lagged { missed });
                }
                Err(_) => return None,
            }
        }
    }

    pub fn query(&self) -> &ChangeQuery {
        &self.query
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Every key/value pair, frozen at call time.
    async fn snapshot(&self) -> Result<BTreeMap<String, Value>, StoreError>;

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Replace a record. Fails if the status change is not a legal transition.
    async fn update_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_record(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Records of one run, oldest first.
    async fn records_for_run(&self, run_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn save_frame(&self, frame: &PlanFrame) -> Result<(), StoreError>;

    async fn latest_frame(&self, run_id: &str) -> Result<Option<PlanFrame>, StoreError>;

    fn subscribe(&self, query: ChangeQuery) -> Subscription;
}

/// Shared check used by every backend before overwriting a record.
pub(crate) fn check_update(
    existing: &ExecutionRecord,
    next: &ExecutionRecord,
) -> Result<(), RecordError> {
    if existing.status == next.status || existing.status.can_transition_to(&next.status) {
        Ok(())
    } else {
        Err(RecordError::InvalidTransition {
            id: existing.id.clone(),
            from: existing.status,
            to: next.status,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Process-local store, the default when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    kv: DashMap<String, Value>,
    records: DashMap<String, ExecutionRecord>,
    frames: DashMap<String, Vec<PlanFrame>>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.kv.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.kv.insert(key.to_string(), value);
        self.notifier.notify(StoreChange::Key {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        Ok(self
            .kv
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        match self.records.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::DuplicateRecord(record.id.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        self.notifier.notify(StoreChange::Record {
            id: record.id.clone(),
            run_id: record.run_id.clone(),
            status: record.status,
        });
        Ok(())
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        {
            let mut existing = self
                .records
                .get_mut(&record.id)
                .ok_or_else(|| StoreError::RecordNotFound(record.id.clone()))?;
            check_update(&existing, record)?;
            *existing = record.clone();
        }
        self.notifier.notify(StoreChange::Record {
            id: record.id.clone(),
            run_id: record.run_id.clone(),
            status: record.status,
        });
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn records_for_run(&self, run_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut out: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn save_frame(&self, frame: &PlanFrame) -> Result<(), StoreError> {
        self.frames
            .entry(frame.run_id.clone())
            .or_default()
            .push(frame.clone());
        self.notifier.notify(StoreChange::Frame {
            run_id: frame.run_id.clone(),
            sequence: frame.sequence,
        });
        Ok(())
    }

    async fn latest_frame(&self, run_id: &str) -> Result<Option<PlanFrame>, StoreError> {
        Ok(self
            .frames
            .get(run_id)
            .and_then(|frames| frames.iter().max_by_key(|f| f.sequence).cloned()))
    }

    fn subscribe(&self, query: ChangeQuery) -> Subscription {
        self.notifier.subscribe(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matching() {
        let key = StoreChange::Key {
            key: "approval:r1:a".into(),
        };
        let rec = StoreChange::Record {
            id: "x".into(),
            run_id: "r1".into(),
            status: ExecutionStatus::Completed,
        };
        assert!(ChangeQuery::KeyPrefix("approval:".into()).matches(&key));
        assert!(!ChangeQuery::KeyPrefix("approval:".into()).matches(&rec));
        assert!(ChangeQuery::Records { run_id: "r1".into() }.matches(&rec));
        assert!(!ChangeQuery::Records { run_id: "r2".into() }.matches(&rec));

        let run = ChangeQuery::Run {
            run_id: "r1".into(),
            key_prefix: String::new(),
        };
        assert!(run.matches(&key) && run.matches(&rec));
        assert!(run.matches(&StoreChange::Lagged { missed: 3 }));
    }

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(ChangeQuery::KeyPrefix("a".into()));
        store.set("b", Value::from(1)).await.unwrap();
        store.set("a1", Value::from(2)).await.unwrap();
        assert_eq!(
            sub.recv().await,
            Some(StoreChange::Key { key: "a1".into() })
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn record_updates_are_monotonic() {
        let store = MemoryStore::new();
        let mut rec = ExecutionRecord::new("r", "root/a:claude", Some("a".into()), "claude");
        store.insert_record(&rec).await.unwrap();
        assert!(matches!(
            store.insert_record(&rec).await,
            Err(StoreError::DuplicateRecord(_))
        ));

        rec.transition(ExecutionStatus::Running).unwrap();
        store.update_record(&rec).await.unwrap();
        rec.transition(ExecutionStatus::Failed).unwrap();
        store.update_record(&rec).await.unwrap();

        let mut stale = rec.clone();
        stale.status = ExecutionStatus::Running;
        assert!(matches!(
            store.update_record(&stale).await,
            Err(StoreError::Transition(_))
        ));
        assert_eq!(
            store.get_record(&rec.id).await.unwrap().map(|r| r.status),
            Some(ExecutionStatus::Failed)
        );
    }

    #[tokio::test]
    async fn latest_frame_by_sequence() {
        let store = MemoryStore::new();
        store.save_frame(&PlanFrame::new("r", 1, "<a />")).await.unwrap();
        store.save_frame(&PlanFrame::new("r", 2, "<b />")).await.unwrap();
        let latest = store.latest_frame("r").await.unwrap().unwrap();
        assert_eq!(latest.xml, "<b />");
        assert!(store.latest_frame("other").await.unwrap().is_none());
    }
}
