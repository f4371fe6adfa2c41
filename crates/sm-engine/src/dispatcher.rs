//! Concurrency manager: runs each eligible node's invocation as its own task
//! and guarantees at most one invocation in flight per node.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use sm_core::record::ExecutionRecord;
use sm_core::tree::NodeId;
use sm_harness::middleware::InvocationError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identity of one dispatch: the node plus the reconciler generation that
/// dispatched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub node: NodeId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("node {node} already has an invocation in flight")]
    AlreadyInFlight { node: NodeId },

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("dispatch of {path} ended without a result")]
    Aborted { path: String },
}

pub type DispatchResult = Result<ExecutionRecord, DispatchError>;

#[derive(Debug, Clone)]
pub struct InFlight {
    pub key: DispatchKey,
    pub path: String,
    pub record_id: String,
    pub started: Instant,
}

/// What [`Dispatcher::drain`] saw: dispatches that finished in time and
/// those aborted at the deadline.
#[derive(Debug, Default)]
pub struct Drain {
    pub completed: Vec<Completion>,
    pub aborted: Vec<InFlight>,
}

#[derive(Debug)]
pub struct Completion {
    pub key: DispatchKey,
    pub path: String,
    pub record_id: String,
    pub result: DispatchResult,
}

/// Reports the task's result, or `Aborted` if the task is dropped first.
struct CompletionGuard {
    tx: flume::Sender<Completion>,
    key: DispatchKey,
    path: String,
    record_id: String,
    sent: bool,
}

impl CompletionGuard {
    fn send(mut self, result: DispatchResult) {
        self.sent = true;
        let _ = self.tx.send(Completion {
            key: self.key,
            path: self.path.clone(),
            record_id: self.record_id.clone(),
            result,
        });
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Completion {
                key: self.key,
                path: self.path.clone(),
                record_id: self.record_id.clone(),
                result: Err(DispatchError::Aborted {
                    path: self.path.clone(),
                }),
            });
        }
    }
}

pub struct Dispatcher {
    in_flight: HashMap<NodeId, InFlight>,
    tasks: HashMap<NodeId, JoinHandle<()>>,
    tx: flume::Sender<Completion>,
    rx: flume::Receiver<Completion>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            in_flight: HashMap::new(),
            tasks: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Spawn `work` for the node in `key`. Fails if that node already has a
    /// dispatch in flight, whatever its generation.
    pub fn dispatch<F>(
        &mut self,
        key: DispatchKey,
        path: impl Into<String>,
        record_id: impl Into<String>,
        work: F,
    ) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<ExecutionRecord, InvocationError>> + Send + 'static,
    {
        if self.in_flight.contains_key(&key.node) {
            return Err(DispatchError::AlreadyInFlight { node: key.node });
        }
        let path = path.into();
        let record_id = record_id.into();
        let guard = CompletionGuard {
            tx: self.tx.clone(),
            key,
            path: path.clone(),
            record_id: record_id.clone(),
            sent: false,
        };
        let handle = tokio::spawn(async move {
            let result = work.await;
            guard.send(result.map_err(DispatchError::from));
        });
        debug!(node = %key.node, generation = key.generation, %path, "dispatched");
        self.tasks.insert(key.node, handle);
        self.in_flight.insert(
            key.node,
            InFlight {
                key,
                path,
                record_id,
                started: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, node: NodeId) -> bool {
        self.in_flight.contains_key(&node)
    }

    pub fn in_flight_nodes(&self) -> HashSet<NodeId> {
        self.in_flight.keys().copied().collect()
    }

    pub fn in_flight_entries(&self) -> impl Iterator<Item = &InFlight> {
        self.in_flight.values()
    }

    /// Wait for the next dispatch to finish. `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        while !self.in_flight.is_empty() {
            let completion = self.rx.recv_async().await.ok()?;
            if self.settle(&completion) {
                return Some(completion);
            }
        }
        None
    }

    /// A finished dispatch, if one is ready right now.
    pub fn try_next_completion(&mut self) -> Option<Completion> {
        while let Ok(completion) = self.rx.try_recv() {
            if self.settle(&completion) {
                return Some(completion);
            }
        }
        None
    }

    /// Wait for every in-flight dispatch, up to `timeout`. Whatever is still
    /// running afterwards is aborted and returned in [`Drain::aborted`].
    pub async fn drain(&mut self, timeout: Duration) -> Drain {
        let deadline = Instant::now() + timeout;
        let mut drain = Drain::default();
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.next_completion()).await {
                Ok(Some(completion)) => drain.completed.push(completion),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.in_flight.len(),
                        "drain timeout, aborting in-flight dispatches"
                    );
                    drain.aborted = self.abort_all();
                    break;
                }
            }
        }
        drain
    }

    /// Abort every in-flight task. Their late `Aborted` completions are
    /// discarded as stale.
    pub fn abort_all(&mut self) -> Vec<InFlight> {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
        self.in_flight.drain().map(|(_, entry)| entry).collect()
    }

    /// Drop bookkeeping for a completion. Stale completions (from aborted or
    /// superseded dispatches) return `false`.
    fn settle(&mut self, completion: &Completion) -> bool {
        match self.in_flight.get(&completion.key.node) {
            Some(entry) if entry.key == completion.key => {
                self.in_flight.remove(&completion.key.node);
                self.tasks.remove(&completion.key.node);
                true
            }
            _ => false,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
