use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// StopSignal: cooperative stop for a run
// ---------------------------------------------------------------------------

/// Shared "stop requested" flag for one run.
///
/// Once set, new invocations are recorded as skipped instead of spawned, and
/// the scheduler stops evaluating new passes. Work already in flight finishes.
///
/// ```ignore
/// let stop = StopSignal::new();
/// let mut rx = stop.subscribe();
///
/// tokio::select! {
///     _ = stop.stopped() => { /* wind down */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StopSignal {
    trigger: broadcast::Sender<String>,
    requested: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
    state_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (state_tx, state_rx) = watch::channel(false);
        Self {
            trigger,
            requested: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
        }
    }

    /// Receives the reason once, when a stop is first requested.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.trigger.subscribe()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Request a stop. Only the first request's reason is kept.
    pub fn request_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(%reason, "stop requested");
            *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
            self.state_tx.send_replace(true);
            let _ = self.trigger.send(reason);
        } else {
            warn!(%reason, "stop already requested");
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolves once a stop has been requested, immediately if it already was.
    pub async fn stopped(&self) {
        let mut rx = self.state_rx.clone();
        // The sender lives in `self`, so this only errors if it never fires.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
